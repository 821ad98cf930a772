//! Report Merger
//!
//! Merging is a fold: concatenate entries, add up the per-rule counters and keep the
//! earliest creation date seen. Redelivered merges therefore never move the reported
//! creation time forward.

use super::types::*;

use std::collections::HashMap;

/// Folds `other` into `target`.
pub fn absorb(target: &mut ValidationReport, other: ValidationReport) {
    target.creation_date = match (target.creation_date, other.creation_date) {
        (Some(current), Some(candidate)) => Some(current.min(candidate)),
        (current, candidate) => current.or(candidate),
    };

    for (rule_code, count) in other.entries_per_rule {
        *target.entries_per_rule.entry(rule_code).or_insert(0) += count;
    }
    target.entries.extend(other.entries);
}

/// Merges reports in the given order into one report for `codespace` / `run_id`.
pub fn merge<I>(codespace: &str, run_id: &str, reports: I) -> ValidationReport
where
    I: IntoIterator<Item = ValidationReport>,
{
    let mut merged = ValidationReport::empty(codespace, run_id);
    for report in reports {
        absorb(&mut merged, report);
    }
    merged
}

/// Keeps at most `max_per_rule` entries per rule code, in original order.
/// Returns the number of entries dropped. Counters are left untouched.
pub fn truncate(report: &mut ValidationReport, max_per_rule: usize) -> usize {
    let mut kept_per_rule: HashMap<String, usize> = HashMap::new();
    let mut dropped_per_rule: HashMap<String, usize> = HashMap::new();

    report.entries.retain(|entry| {
        let kept = kept_per_rule.entry(entry.rule_code.clone()).or_insert(0);
        if *kept < max_per_rule {
            *kept += 1;
            true
        } else {
            *dropped_per_rule.entry(entry.rule_code.clone()).or_insert(0) += 1;
            false
        }
    });

    for (rule_code, dropped) in &dropped_per_rule {
        tracing::warn!(
            "Report {} truncated: dropped {} entries for rule {} (limit {})",
            report.run_id,
            dropped,
            rule_code,
            max_per_rule
        );
    }

    dropped_per_rule.values().sum()
}
