// SPDX-License-Identifier: GPL-2.0

//! Cache-domain topology detection.
//!
//! Each CPU exports the set of CPUs sharing its L3 cache under
//! `/sys/devices/system/cpu/cpu*/cache/index3/shared_cpu_list`. On multi-CCD
//! parts every CCD yields one distinct list. The list containing CPU 0
//! becomes the OS domain; the union of the remaining lists becomes the game
//! domain.

use std::collections::BTreeSet;

use glob::glob;
use log::debug;
use thiserror::Error;

use crate::cpulist;

const SHARED_CPU_LIST_GLOB: &str = "/sys/devices/system/cpu/cpu*/cache/index3/shared_cpu_list";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no valid cpu lists")]
    NoValidCpuLists,
    #[error("no cpu list contains CPU0: {0:?}")]
    NoOsCandidate(Vec<String>),
    #[error("no index3 shared_cpu_list files found")]
    NoCacheFiles,
    #[error("failed to read any cpu lists")]
    NoReadableCacheFiles,
}

#[derive(Debug, Clone)]
pub struct TopologyResult {
    pub os_cpus: String,
    pub game_cpus: String,
    pub lists: Vec<String>,
}

/// Pick OS CPUs as the list containing CPU 0 and game CPUs as the union of
/// all other lists. Unparsable or empty entries are skipped; the surviving
/// canonical lists are deduplicated and sorted so the selection is
/// deterministic across runs.
pub fn select_os_and_game(
    lists: &[String],
) -> Result<(String, String, Vec<String>), TopologyError> {
    let mut uniq = BTreeSet::new();
    for raw in lists {
        match cpulist::canonicalize(raw) {
            Ok((canonical, _)) if !canonical.is_empty() => {
                uniq.insert(canonical);
            }
            _ => continue,
        }
    }
    if uniq.is_empty() {
        return Err(TopologyError::NoValidCpuLists);
    }
    let canonical_lists: Vec<String> = uniq.into_iter().collect();

    let os_cpus = canonical_lists
        .iter()
        .find(|s| {
            cpulist::parse(s)
                .map(|cpus| cpulist::contains(&cpus, 0))
                .unwrap_or(false)
        })
        .cloned()
        .ok_or_else(|| TopologyError::NoOsCandidate(canonical_lists.clone()))?;

    // Lists that overlap CPU 0 are excluded from the game side rather than
    // double-counted.
    let mut game = BTreeSet::new();
    for s in &canonical_lists {
        let Ok(cpus) = cpulist::parse(s) else {
            continue;
        };
        if cpulist::contains(&cpus, 0) {
            continue;
        }
        game.extend(cpus);
    }
    let game_cpus = cpulist::format(&game);

    Ok((os_cpus, game_cpus, canonical_lists))
}

/// Detect the OS/game split from the host's L3 sharing domains.
pub fn detect() -> Result<TopologyResult, TopologyError> {
    let paths: Vec<_> = glob(SHARED_CPU_LIST_GLOB)
        .expect("shared_cpu_list glob pattern is valid")
        .filter_map(|entry| entry.ok())
        .collect();
    if paths.is_empty() {
        return Err(TopologyError::NoCacheFiles);
    }

    let mut raw = Vec::with_capacity(paths.len());
    for path in paths {
        // A CPU may go offline between globbing and reading.
        match std::fs::read_to_string(&path) {
            Ok(content) => raw.push(content),
            Err(err) => debug!("skipping unreadable {}: {err}", path.display()),
        }
    }
    if raw.is_empty() {
        return Err(TopologyError::NoReadableCacheFiles);
    }

    let (os_cpus, game_cpus, lists) = select_os_and_game(&raw)?;
    Ok(TopologyResult {
        os_cpus,
        game_cpus,
        lists,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(lists: &[&str]) -> Vec<String> {
        lists.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_os_and_game() {
        let (os, game, lists) = select_os_and_game(&strings(&["0-3", "4-7"])).unwrap();
        assert_eq!(os, "0-3");
        assert_eq!(game, "4-7");
        assert_eq!(lists.len(), 2);
    }

    #[test]
    fn test_select_deduplicates_per_cpu_lists() {
        // One descriptor per CPU, two distinct sharing domains.
        let raw = strings(&["0-7\n", "0-7\n", "8-15\n", "8-15\n", "0-7\n"]);
        let (os, game, lists) = select_os_and_game(&raw).unwrap();
        assert_eq!(os, "0-7");
        assert_eq!(game, "8-15");
        assert_eq!(lists, vec!["0-7".to_string(), "8-15".to_string()]);
    }

    #[test]
    fn test_select_unions_multiple_game_domains() {
        let (_, game, _) = select_os_and_game(&strings(&["0-3", "8-11", "4-7"])).unwrap();
        assert_eq!(game, "4-11");
    }

    #[test]
    fn test_select_no_os_candidate() {
        let err = select_os_and_game(&strings(&["4-7", "8-11"])).unwrap_err();
        assert!(matches!(err, TopologyError::NoOsCandidate(_)));
    }

    #[test]
    fn test_select_no_valid_lists() {
        assert!(matches!(
            select_os_and_game(&[]).unwrap_err(),
            TopologyError::NoValidCpuLists
        ));
        assert!(matches!(
            select_os_and_game(&strings(&["bogus", ""])).unwrap_err(),
            TopologyError::NoValidCpuLists
        ));
    }

    #[test]
    fn test_select_skips_overlapping_cpu0_list() {
        // A second list containing CPU 0 must neither be chosen (sorted order
        // makes "0-3" win) nor folded into the game set.
        let (os, game, _) = select_os_and_game(&strings(&["0-3", "0-5", "8-11"])).unwrap();
        assert_eq!(os, "0-3");
        assert_eq!(game, "8-11");
    }
}
