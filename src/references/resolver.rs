use super::registry::StopPlaceRegistry;
use super::resolvers::*;
use crate::ids::types::{IdVersion, ShardIds};
use crate::report::types::{Finding, Location, rules};

use std::collections::HashSet;
use std::sync::Arc;

/// Something that can confirm a reference points to a valid external element.
pub trait ReferenceResolver: Send + Sync {
    fn name(&self) -> &str;

    fn vouches_for(&self, reference: &IdVersion) -> bool;
}

/// An ordered list of resolvers. Order matters: the ignorers run before the
/// registry lookups so expected-external shapes never reach a registry.
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ReferenceResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn ReferenceResolver>>) -> Self {
        Self { resolvers }
    }

    /// Block journeys, interchanges, rolling stock, stop place registry.
    pub fn standard(rolling_stock_codespace: &str, registry: Arc<StopPlaceRegistry>) -> Self {
        Self::new(vec![
            Box::new(BlockJourneyIgnorer::new()),
            Box::new(InterchangeIgnorer::new()),
            Box::new(RollingStockResolver::new(rolling_stock_codespace)),
            Box::new(StopPlaceRegistryResolver::new(registry)),
        ])
    }

    pub fn names(&self) -> Vec<&str> {
        self.resolvers.iter().map(|resolver| resolver.name()).collect()
    }

    /// References of `ids` that neither the shard, the run's common ids, nor any
    /// resolver of the chain can account for, in document order.
    pub fn unresolved<'a>(
        &self,
        ids: &'a ShardIds,
        common_ids: &HashSet<String>,
    ) -> Vec<&'a IdVersion> {
        let local_bare_ids = ids.bare_ids();

        let mut unresolved: Vec<&IdVersion> = ids
            .local_refs
            .iter()
            .filter(|reference| !resolves_locally(reference, ids, &local_bare_ids))
            .filter(|reference| !common_ids.contains(&reference.id))
            .collect();

        for resolver in &self.resolvers {
            if unresolved.is_empty() {
                break;
            }
            let before = unresolved.len();
            unresolved.retain(|reference| !resolver.vouches_for(reference));

            tracing::trace!(
                "Resolver {} vouched for {} references",
                resolver.name(),
                before - unresolved.len()
            );
        }

        unresolved
    }

    /// One error finding per unresolved reference.
    pub fn findings(&self, ids: &ShardIds, common_ids: &HashSet<String>) -> Vec<Finding> {
        self.unresolved(ids, common_ids)
            .into_iter()
            .map(unresolved_finding)
            .collect()
    }
}

/// Same `(id, version)` defined in the shard. A reference without a version accepts
/// any local version of the id.
fn resolves_locally(
    reference: &IdVersion,
    ids: &ShardIds,
    local_bare_ids: &HashSet<String>,
) -> bool {
    match reference.version {
        Some(_) => ids.local_ids.contains(reference),
        None => local_bare_ids.contains(&reference.id),
    }
}

fn unresolved_finding(reference: &IdVersion) -> Finding {
    let version = reference.version.as_deref().unwrap_or("any");
    Finding::error(
        rules::UNRESOLVED_REFERENCE,
        format!(
            "Unresolved reference to {} (version {}) in {}",
            reference.id, version, reference.element_name
        ),
    )
    .at(Location::at(
        &reference.shard_name,
        reference.line,
        reference.column,
        &reference.id,
    ))
}
