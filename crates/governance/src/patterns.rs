//! Blocked-pattern matching over canonicalized tool arguments.
//!
//! Arguments are rendered to a single canonical string (JSON with object keys
//! in sorted order) so the same logical arguments always produce the same
//! text, whatever key order the caller used.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use gov_bridge_core::{Error, Result};

/// Compiled size cap per pattern. Keeps a hostile policy from exhausting memory.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Canonical string form of a tool's arguments.
///
/// Object keys are emitted in sorted order, so `{"b":1,"a":2}` and
/// `{"a":2,"b":1}` canonicalize identically.
pub fn canonical_arguments(arguments: &Value) -> String {
    // serde_json's default map is ordered by key
    serde_json::to_string(arguments).unwrap_or_default()
}

/// An ordered set of case-insensitive blocked patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    /// Compile every pattern. Fails on the first invalid one, naming its index.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .enumerate()
            .map(|(index, source)| {
                RegexBuilder::new(source)
                    .case_insensitive(true)
                    .size_limit(PATTERN_SIZE_LIMIT)
                    .build()
                    .map_err(|e| {
                        Error::invalid_policy(format!(
                            "blocked pattern {} ('{}') does not compile: {}",
                            index, source, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// Index of the first pattern (in list order) that matches anywhere in `text`.
    pub fn first_match(&self, text: &str) -> Option<usize> {
        self.patterns.iter().position(|p| p.is_match(text))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
