use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use fancy_regex::Regex;

/// Source id reported for a rank that was not retrieved
pub const UNRESOLVED_CITATION: &str = "N/A";

static CITATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+(?:,\s*\d+)*)\]").expect("regex is valid"));

/// Distinct ranks cited as `[1]` or `[2, 5]` in `answer`
#[inline]
pub fn cited_ranks(answer: &str) -> BTreeSet<u64> {
    CITATION_REGEX
        .captures_iter(answer)
        .filter_map(Result::ok)
        .filter_map(|captures| captures.get(1))
        .flat_map(|group| {
            group
                .as_str()
                .split(',')
                .filter_map(|n| n.trim().parse::<u64>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Map every rank cited in `answer` to the source id of the chunk retrieved at that
/// rank, or [`UNRESOLVED_CITATION`]
#[inline]
pub fn resolve_citations<F>(answer: &str, lookup: F) -> BTreeMap<u64, String>
where
    F: Fn(u64) -> Option<String>,
{
    cited_ranks(answer)
        .into_iter()
        .map(|rank| {
            let source = lookup(rank).unwrap_or_else(|| UNRESOLVED_CITATION.to_string());
            (rank, source)
        })
        .collect()
}
