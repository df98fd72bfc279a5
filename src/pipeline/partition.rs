//! Static assignment of search terms to polling workers.

use std::collections::BTreeMap;

use crate::error::{AppError, Result};

/// Terms per language for one worker.
pub type TermAssignment = BTreeMap<String, Vec<String>>;

/// Deal every language's terms round-robin over `workers`.
///
/// The cursor carries over from one language to the next, so worker loads
/// differ by at most one term. Every worker gets an entry, possibly empty,
/// for every language.
pub fn partition(
    languages: &[String],
    terms: &BTreeMap<String, Vec<String>>,
    workers: usize,
) -> Result<Vec<TermAssignment>> {
    if workers == 0 {
        return Err(AppError::invalid_argument(
            "cannot partition terms over zero workers",
        ));
    }

    let mut assignments: Vec<TermAssignment> = (0..workers)
        .map(|_| {
            languages
                .iter()
                .map(|lang| (lang.clone(), Vec::new()))
                .collect()
        })
        .collect();

    let mut cursor = 0;
    for lang in languages {
        for term in terms.get(lang).into_iter().flatten() {
            assignments[cursor]
                .entry(lang.clone())
                .or_default()
                .push(term.clone());
            cursor = (cursor + 1) % workers;
        }
    }

    Ok(assignments)
}
