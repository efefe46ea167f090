//! Extra filters applied to time series queries.
use std::fmt;

use tracing::warn;

/// Separator between the targeted prefix and the query of an extra filter flag.
pub const EXTRA_FILTER_SEPARATOR: char = ':';

/// An additional query for metric types starting with a given prefix.
///
/// The query is appended to the time series filter of every metric type that starts with
/// `targeted_metric_prefix`, e.g. `pubsub.googleapis.com/subscription` paired with
/// `resource.labels.subscription_id=monitoring.regex.full_match("my-subs-prefix.*")`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricFilter {
    /// Lowercased prefix of the metric types this filter applies to.
    pub targeted_metric_prefix: String,
    /// Monitoring filter expression, verbatim.
    pub filter_query: String,
}

impl MetricFilter {
    /// Returns `true` if this filter applies to the given metric type.
    pub fn applies_to(&self, metric_type: &str) -> bool {
        metric_type.to_lowercase().starts_with(&self.targeted_metric_prefix)
    }
}

impl fmt::Display for MetricFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.targeted_metric_prefix, EXTRA_FILTER_SEPARATOR, self.filter_query)
    }
}

/// Parses extra filter flags of the form `<prefix><separator><query>`.
///
/// Each entry is split at the first separator.  Entries with an empty prefix are skipped, and
/// entries without any separator are skipped with a warning.
pub fn parse_extra_filters<S: AsRef<str>>(filters: &[S], separator: char) -> Vec<MetricFilter> {
    filters
        .iter()
        .filter_map(|filter| {
            let filter = filter.as_ref();
            let Some((prefix, query)) = filter.split_once(separator) else {
                if !filter.is_empty() {
                    warn!(%filter, %separator, "ignoring extra filter without separator");
                }
                return None;
            };
            if prefix.is_empty() {
                return None;
            }

            Some(MetricFilter {
                targeted_metric_prefix: prefix.to_lowercase(),
                filter_query: query.to_string(),
            })
        })
        .collect()
}

/// Why a filter query cannot be sent to the API.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryProblem {
    /// The query is empty.
    Empty,
    /// A parenthesis is never closed, or closed without being opened.
    UnbalancedParentheses,
    /// A double-quoted string is never closed.
    UnterminatedString,
}

impl fmt::Display for QueryProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryProblem::Empty => f.write_str("query is empty"),
            QueryProblem::UnbalancedParentheses => f.write_str("unbalanced parentheses"),
            QueryProblem::UnterminatedString => f.write_str("unterminated string literal"),
        }
    }
}

/// Checks that a filter query is well formed enough to be appended to another filter.
///
/// Parentheses inside double-quoted strings are ignored, and `\"` does not end a string.
pub fn check_filter_query(query: &str) -> Result<(), QueryProblem> {
    if query.trim().is_empty() {
        return Err(QueryProblem::Empty);
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for c in query.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(QueryProblem::UnbalancedParentheses)?,
            _ => {}
        }
    }

    if in_string {
        return Err(QueryProblem::UnterminatedString);
    }
    if depth != 0 {
        return Err(QueryProblem::UnbalancedParentheses);
    }
    Ok(())
}
