// SPDX-License-Identifier: GPL-2.0

//! Parsing and formatting of kernel-style CPU list strings ("0-3,5").
//!
//! The canonical form is sorted ascending with consecutive CPUs merged into
//! inclusive ranges. Re-parsing a canonical string yields the identical set,
//! so all downstream comparisons operate on canonical strings.

use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid cpu range {0:?}")]
    InvalidRange(String),
    #[error("invalid cpu {0:?}")]
    InvalidNumber(String),
}

/// Parse a CPU list string into a set of CPU ids. Empty or whitespace-only
/// input yields an empty set. Duplicates and overlapping ranges are unioned.
pub fn parse(s: &str) -> Result<BTreeSet<usize>, ParseError> {
    let mut cpus = BTreeSet::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            // Bounds parse signed so "0--1" is classified as a bad range,
            // not a bad number.
            let start = parse_bound(lo)?;
            let end = parse_bound(hi)?;
            if start > end {
                return Err(ParseError::InvalidRange(part.to_string()));
            }
            cpus.extend(start as usize..=end as usize);
        } else {
            cpus.insert(parse_cpu(part)?);
        }
    }
    Ok(cpus)
}

fn parse_cpu(token: &str) -> Result<usize, ParseError> {
    token
        .trim()
        .parse::<usize>()
        .map_err(|_| ParseError::InvalidNumber(token.trim().to_string()))
}

fn parse_bound(token: &str) -> Result<i64, ParseError> {
    token
        .trim()
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidNumber(token.trim().to_string()))
}

/// Format a set of CPU ids into the canonical run-length-encoded list string.
/// An empty set formats to the empty string.
pub fn format(cpus: &BTreeSet<usize>) -> String {
    let mut runs: Vec<String> = Vec::new();
    let mut iter = cpus.iter().copied();
    let Some(first) = iter.next() else {
        return String::new();
    };

    let mut start = first;
    let mut prev = first;
    let flush = |s: usize, e: usize, runs: &mut Vec<String>| {
        if s == e {
            runs.push(s.to_string());
        } else {
            runs.push(format!("{s}-{e}"));
        }
    };
    for cpu in iter {
        if cpu == prev + 1 {
            prev = cpu;
            continue;
        }
        flush(start, prev, &mut runs);
        start = cpu;
        prev = cpu;
    }
    flush(start, prev, &mut runs);
    runs.join(",")
}

/// Parse then re-format, returning both the canonical string and the set.
pub fn canonicalize(s: &str) -> Result<(String, BTreeSet<usize>), ParseError> {
    let cpus = parse(s)?;
    Ok((format(&cpus), cpus))
}

pub fn contains(cpus: &BTreeSet<usize>, cpu: usize) -> bool {
    cpus.contains(&cpu)
}
