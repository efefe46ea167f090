//! Metric type prefix handling.
use std::collections::BTreeSet;

/// Normalizes a list of metric type prefixes.
///
/// The prefixes are sorted and deduplicated, and any prefix that starts with a previously kept
/// prefix is dropped: querying both `compute.googleapis.com/` and
/// `compute.googleapis.com/instance/cpu` would collect the same series twice, which the registry
/// rejects at gather time.
///
/// Normalizing an already normalized list returns it unchanged.
pub fn normalize_prefixes(mut prefixes: Vec<String>) -> Vec<String> {
    prefixes.sort_unstable();
    prefixes.dedup();

    let mut normalized: Vec<String> = Vec::with_capacity(prefixes.len());
    for prefix in prefixes {
        if let Some(kept) = normalized.last() {
            if prefix.starts_with(kept.as_str()) {
                continue;
            }
        }
        normalized.push(prefix);
    }

    normalized
}

/// The set of prefixes requested for a single scrape.
///
/// An empty selection stands for every configured prefix.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SelectionSet {
    prefixes: BTreeSet<String>,
}

impl SelectionSet {
    /// Creates an empty selection, which selects every configured prefix.
    pub fn all() -> Self {
        Self::default()
    }

    /// Returns `true` if no prefix was explicitly requested.
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Returns `true` if the given prefix was explicitly requested.
    pub fn contains(&self, prefix: &str) -> bool {
        self.prefixes.contains(prefix)
    }

    /// Iterates over the requested prefixes.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for SelectionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        SelectionSet { prefixes: iter.into_iter().map(Into::into).collect() }
    }
}

/// Narrows the configured prefixes to the ones in `selection`.
///
/// Requested prefixes that are not configured are ignored, so the result is always a subset of
/// `configured`, in the same order.  The configured list itself is never modified.
pub fn select_prefixes(configured: &[String], selection: &SelectionSet) -> Vec<String> {
    if selection.is_empty() {
        return configured.to_vec();
    }

    configured.iter().filter(|prefix| selection.contains(prefix)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_overlapping_prefixes_are_collapsed() {
        let normalized = normalize_prefixes(strings(&[
            "compute.googleapis.com/",
            "compute.googleapis.com/instance/cpu",
            "pubsub.googleapis.com/",
        ]));
        assert_eq!(normalized, strings(&["compute.googleapis.com/", "pubsub.googleapis.com/"]));
    }

    #[test]
    fn test_chain_collapse_keeps_outermost_prefix() {
        let normalized = normalize_prefixes(strings(&[
            "a.googleapis.com/x/y",
            "a.googleapis.com/",
            "a.googleapis.com/x",
            "a.googleapis.com/",
            "b.googleapis.com/",
        ]));
        assert_eq!(normalized, strings(&["a.googleapis.com/", "b.googleapis.com/"]));
    }

    #[test]
    fn test_empty_input() {
        assert!(normalize_prefixes(Vec::new()).is_empty());
    }

    #[test]
    fn test_selection_narrows_configured_prefixes() {
        let configured = strings(&["a/", "b/"]);

        let selected = select_prefixes(&configured, &["a/"].into_iter().collect());
        assert_eq!(selected, strings(&["a/"]));

        let selected = select_prefixes(&configured, &["c/"].into_iter().collect());
        assert!(selected.is_empty());

        let selected = select_prefixes(&configured, &SelectionSet::all());
        assert_eq!(selected, configured);
        assert_eq!(configured, strings(&["a/", "b/"]));
    }

    proptest! {
        #[test]
        fn test_normalized_prefixes_are_sorted_and_prefix_free(
            input in vec("[abc/]{0,6}", 0..16)
        ) {
            let normalized = normalize_prefixes(input.clone());

            for pair in normalized.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
            for (i, earlier) in normalized.iter().enumerate() {
                for later in &normalized[i + 1..] {
                    prop_assert!(!later.starts_with(earlier.as_str()));
                }
            }
            for prefix in &input {
                prop_assert!(normalized.iter().any(|kept| prefix.starts_with(kept.as_str())));
            }
        }

        #[test]
        fn test_normalization_is_idempotent(input in vec("[abc/]{0,6}", 0..16)) {
            let once = normalize_prefixes(input);
            let twice = normalize_prefixes(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_selection_is_a_subset(
            configured in vec("[ab/]{1,4}", 0..8),
            requested in vec("[ab/]{1,4}", 0..8),
        ) {
            let selection = requested.iter().cloned().collect::<SelectionSet>();
            let selected = select_prefixes(&configured, &selection);
            for prefix in &selected {
                prop_assert!(configured.contains(prefix));
                prop_assert!(selection.is_empty() || selection.contains(prefix));
            }
        }
    }
}
