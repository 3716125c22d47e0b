// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Snapshot selection expressions: `a,b,c` lists and `from%to` ranges.

/// Select snapshot short names from `ordered` (oldest first) according to
/// `spec`.
///
/// Each comma-separated element is either an exact short name or a range
/// `from%to` covering everything between the two snapshots inclusive. An
/// empty bound extends the range to the oldest or newest snapshot. Names
/// that match nothing are skipped. The result keeps creation order and has
/// no duplicates.
pub fn select<'a>(ordered: &'a [String], spec: &str) -> Vec<&'a str> {
    let mut picked = vec![false; ordered.len()];

    for element in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match element.split_once('%') {
            Some((from, to)) => {
                let start = if from.is_empty() {
                    Some(0)
                } else {
                    ordered.iter().position(|n| n == from)
                };
                let end = if to.is_empty() {
                    ordered.len().checked_sub(1)
                } else {
                    ordered.iter().position(|n| n == to)
                };
                if let (Some(start), Some(end)) = (start, end) {
                    for slot in picked.iter_mut().take(end + 1).skip(start) {
                        *slot = true;
                    }
                }
            }
            None => {
                if let Some(idx) = ordered.iter().position(|n| n == element) {
                    picked[idx] = true;
                }
            }
        }
    }

    ordered
        .iter()
        .zip(picked)
        .filter_map(|(name, keep)| keep.then_some(name.as_str()))
        .collect()
}

/// Exact names and range bounds in `spec` that name no snapshot in
/// `ordered`. An empty bound always matches.
pub fn unmatched<'a>(ordered: &[String], spec: &'a str) -> Vec<&'a str> {
    let known = |name: &str| name.is_empty() || ordered.iter().any(|n| n == name);
    spec.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .flat_map(|element| match element.split_once('%') {
            Some((from, to)) => vec![from, to],
            None => vec![element],
        })
        .filter(|name| !known(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snaps() -> Vec<String> {
        ["mon", "tue", "wed", "thu", "fri"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_names_and_lists() {
        let s = snaps();
        assert_eq!(select(&s, "tue"), vec!["tue"]);
        assert_eq!(select(&s, "fri,mon"), vec!["mon", "fri"]);
        assert!(select(&s, "sun").is_empty());
    }

    #[test]
    fn ranges() {
        let s = snaps();
        assert_eq!(select(&s, "tue%thu"), vec!["tue", "wed", "thu"]);
        assert_eq!(select(&s, "%tue"), vec!["mon", "tue"]);
        assert_eq!(select(&s, "thu%"), vec!["thu", "fri"]);
        assert!(select(&s, "thu%tue").is_empty());
        assert!(select(&[], "%").is_empty());
    }

    #[test]
    fn overlapping_elements_are_deduplicated() {
        let s = snaps();
        assert_eq!(select(&s, "mon%wed,tue"), vec!["mon", "tue", "wed"]);
    }

    #[test]
    fn unknown_names_and_bounds_are_reported() {
        let s = snaps();
        assert!(unmatched(&s, "mon,tue%thu,%wed,fri%").is_empty());
        assert_eq!(unmatched(&s, "mon,sun"), vec!["sun"]);
        assert_eq!(unmatched(&s, "tue%sat,x%"), vec!["sat", "x"]);
    }
}
