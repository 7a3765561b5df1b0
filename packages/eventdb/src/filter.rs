//! Declarative predicates compiled once and evaluated against a part's
//! [`FullIndex`].
//!
//! Predicates are conjunctive: each one narrows the candidate bitmap in
//! place. Regex values are compiled at [`Filters::compile`] time, never per
//! part or per row.

use regex_lite::Regex;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::bsi::RangeOp;
use crate::error::{EngineError, Result};
use crate::index::FullIndex;

/// String comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Neq,
    ReEq,
    ReNeq,
}

/// One predicate as supplied by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column op value` over a dictionary-coded string column.
    Text { column: String, op: Op, value: String },
    /// Numeric comparison over an indexed integer column.
    Range { column: String, op: RangeOp },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Text {
            column: column.into(),
            op: Op::Eq,
            value: value.into(),
        }
    }

    pub fn neq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Text {
            column: column.into(),
            op: Op::Neq,
            value: value.into(),
        }
    }

    pub fn re_eq(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Text {
            column: column.into(),
            op: Op::ReEq,
            value: pattern.into(),
        }
    }

    pub fn re_neq(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Text {
            column: column.into(),
            op: Op::ReNeq,
            value: pattern.into(),
        }
    }

    pub fn range(column: impl Into<String>, op: RangeOp) -> Self {
        Filter::Range {
            column: column.into(),
            op,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Text { column, .. } | Filter::Range { column, .. } => column,
        }
    }
}

#[derive(Debug, Clone)]
enum TextMatcher {
    Eq(String),
    Neq(String),
    Re(Regex),
    NotRe(Regex),
}

#[derive(Debug, Clone)]
enum Matcher {
    Text(TextMatcher),
    Range(RangeOp),
}

#[derive(Debug, Clone)]
struct Compiled {
    column: String,
    matcher: Matcher,
}

/// A compiled, immutable predicate list, shareable across parts and threads.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    compiled: Vec<Compiled>,
}

impl Filters {
    /// No predicates; matches every row.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn compile(filters: Vec<Filter>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(filters.len());
        for filter in filters {
            let entry = match filter {
                Filter::Text { column, op, value } => {
                    let matcher = match op {
                        Op::Eq => TextMatcher::Eq(value),
                        Op::Neq => TextMatcher::Neq(value),
                        Op::ReEq => TextMatcher::Re(compile_regex(&column, &value)?),
                        Op::ReNeq => TextMatcher::NotRe(compile_regex(&column, &value)?),
                    };
                    Compiled {
                        column,
                        matcher: Matcher::Text(matcher),
                    }
                }
                Filter::Range { column, op } => Compiled {
                    column,
                    matcher: Matcher::Range(op),
                },
            };
            compiled.push(entry);
        }
        Ok(Self { compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Narrow `candidates` to the rows satisfying every predicate.
    ///
    /// A predicate on a column with no index in this part (absent or
    /// entirely null) matches nothing. Negations subtract from the
    /// candidates, so null rows survive `neq`/`re_neq`.
    pub fn apply(&self, candidates: &mut RoaringBitmap, index: &FullIndex) {
        for c in &self.compiled {
            if candidates.is_empty() {
                return;
            }
            match &c.matcher {
                Matcher::Range(op) => match index.bsi(&c.column) {
                    Some(bsi) => *candidates = bsi.compare(*op, candidates),
                    None => candidates.clear(),
                },
                Matcher::Text(text) => {
                    let Some(column) = index.column(&c.column) else {
                        candidates.clear();
                        continue;
                    };
                    match text {
                        TextMatcher::Eq(value) => match column.lookup(value) {
                            Some(rows) => *candidates &= rows,
                            None => candidates.clear(),
                        },
                        TextMatcher::Neq(value) => {
                            if let Some(rows) = column.lookup(value) {
                                *candidates -= rows;
                            }
                        }
                        TextMatcher::Re(re) => *candidates &= column.regex_union(re),
                        TextMatcher::NotRe(re) => *candidates -= column.regex_union(re),
                    }
                }
            }
        }
    }
}

fn compile_regex(column: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::InvalidRegex {
        column: column.to_string(),
        reason: e.to_string(),
    })
}
