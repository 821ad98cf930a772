//! Id Extraction
//!
//! A single streaming pass over a shard. Elements carrying an `id` attribute are
//! definitions, elements carrying a `ref` attribute are references. Positions are
//! reported as 1-based line and column of the element's opening `<`.

use super::types::*;

use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

pub fn extract_ids(shard_name: &str, content: &[u8]) -> Result<ShardIds> {
    let lines = LineIndex::new(content);
    let mut reader = Reader::from_reader(content);
    let mut ancestors: Vec<String> = Vec::new();
    let mut ids = ShardIds::default();

    loop {
        let offset = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .with_context(|| format!("Failed to parse {} near byte {}", shard_name, offset))?;

        match event {
            Event::Start(element) => {
                let name = local_name(&element);
                let (line, column) = lines.position(offset);
                collect(&element, &name, &ancestors, shard_name, line, column, &mut ids)?;
                ancestors.push(name);
            }
            Event::Empty(element) => {
                let name = local_name(&element);
                let (line, column) = lines.position(offset);
                collect(&element, &name, &ancestors, shard_name, line, column, &mut ids)?;
            }
            Event::End(_) => {
                ancestors.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    tracing::trace!(
        "Extracted {} ids and {} references from {}",
        ids.local_ids.len(),
        ids.local_refs.len(),
        shard_name
    );
    Ok(ids)
}

fn collect(
    element: &BytesStart<'_>,
    name: &str,
    ancestors: &[String],
    shard_name: &str,
    line: u64,
    column: u64,
    ids: &mut ShardIds,
) -> Result<()> {
    let mut id = None;
    let mut reference = None;
    let mut version = None;

    for attribute in element.attributes() {
        let attribute = attribute
            .with_context(|| format!("Malformed attribute on <{}> in {}", name, shard_name))?;
        let value = attribute.unescape_value()?.into_owned();
        match attribute.key.local_name().as_ref() {
            b"id" => id = Some(value),
            b"ref" => reference = Some(value),
            b"version" => version = Some(value),
            _ => {}
        }
    }

    let occurrence = |value: String| IdVersion {
        id: value,
        version: version.clone(),
        element_name: name.to_string(),
        parent_element_names: ancestors.to_vec(),
        shard_name: shard_name.to_string(),
        line,
        column,
    };

    if let Some(id) = id {
        ids.local_ids.insert(occurrence(id));
    }
    if let Some(reference) = reference {
        ids.local_refs.push(occurrence(reference));
    }
    Ok(())
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

/// Byte offset to line/column lookup.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(content: &[u8]) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            content
                .iter()
                .enumerate()
                .filter(|(_, byte)| **byte == b'\n')
                .map(|(index, _)| index + 1),
        );
        Self { line_starts }
    }

    fn position(&self, offset: usize) -> (u64, u64) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        let column = offset - self.line_starts[line];
        (line as u64 + 1, column as u64 + 1)
    }
}
