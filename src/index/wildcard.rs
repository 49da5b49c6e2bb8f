//! Wildcard and match-all scorers.
//!
//! Patterns use the SQL LIKE wildcards: `_` matches one character, `%`
//! matches any run, `\` escapes. Execution first enumerates matching terms
//! into a boolean union; when the enumeration exceeds the clause-count
//! threshold it falls back to a direct bitset scan over the term
//! enumeration, cached per reader generation so a repeated query touches
//! no terms at all. Scores are a constant 1.0: these are filters, not
//! rankers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::config::IndexFormatVersion;
use crate::error::Result;
use crate::index::bitset::BitSet;
use crate::index::reader::ReadOnlyIndexReader;
use crate::index::{Transform, PROPERTIES_SET_FIELD};

/// Constant filter score.
pub const SCORE: f32 = 1.0;

const CACHE_SEP: char = '\u{FFFF}';

/// Matching documents with their constant score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hits {
    /// Ascending live document numbers.
    pub docs: Vec<u32>,
    /// Constant score for every hit.
    pub score: f32,
}

/// A LIKE-style wildcard query over one field.
pub struct WildcardQuery {
    field: String,
    pattern: String,
    transform: Transform,
    max_clause_count: usize,
    /// Per-reader bitset cache: (reader generation, cache key) -> bitset.
    cache: Mutex<FxHashMap<(u64, String), Arc<BitSet>>>,
    enumerations: AtomicU64,
}

impl WildcardQuery {
    /// Builds a query. `max_clause_count` is the boolean-rewrite limit.
    pub fn new(
        field: impl Into<String>,
        pattern: impl Into<String>,
        transform: Transform,
        max_clause_count: usize,
    ) -> Self {
        Self {
            field: field.into(),
            pattern: pattern.into(),
            transform,
            max_clause_count,
            cache: Mutex::new(FxHashMap::default()),
            enumerations: AtomicU64::new(0),
        }
    }

    /// Term enumerations performed so far (exercised by cache tests).
    pub fn enumeration_count(&self) -> u64 {
        self.enumerations.load(Ordering::SeqCst)
    }

    fn cache_key(&self) -> String {
        format!(
            "{}{CACHE_SEP}{}{CACHE_SEP}{}",
            self.field,
            self.pattern,
            self.transform.key()
        )
    }

    fn effective_field(&self) -> String {
        self.transform.field_of(&self.field)
    }

    fn effective_pattern(&self) -> String {
        match self.transform {
            Transform::None => self.pattern.clone(),
            Transform::Lower => self.pattern.to_lowercase(),
            Transform::Upper => self.pattern.to_uppercase(),
        }
    }

    /// Runs the query against a read-only reader.
    pub fn execute(&self, reader: &ReadOnlyIndexReader) -> Result<Hits> {
        let key = (reader.generation(), self.cache_key());
        if let Some(bits) = self.cache.lock().get(&key).cloned() {
            trace!(field = %self.field, pattern = %self.pattern, "wildcard.cache.hit");
            return Ok(Hits {
                docs: bits.iter().map(|d| d as u32).collect(),
                score: SCORE,
            });
        }

        let field = self.effective_field();
        let pattern = self.effective_pattern();
        let matcher = LikeMatcher::new(&pattern);
        self.enumerations.fetch_add(1, Ordering::SeqCst);

        // First attempt: boolean rewrite over the enumerated terms.
        let mut clauses: Vec<Vec<u32>> = Vec::new();
        let mut overflowed = false;
        for (term, docs) in reader.terms(&field, None) {
            if !matcher.matches(term) {
                continue;
            }
            if clauses.len() >= self.max_clause_count {
                overflowed = true;
                break;
            }
            clauses.push(docs);
        }

        let bits = if overflowed {
            // Fallback: one bitset sized to max_doc, filled straight from
            // the enumeration, and cached for this reader.
            let mut bits = BitSet::new(reader.max_doc() as usize);
            for (term, docs) in reader.terms(&field, None) {
                if !matcher.matches(term) {
                    continue;
                }
                for doc in docs {
                    bits.set(doc as usize);
                }
            }
            trace!(
                field = %self.field,
                pattern = %self.pattern,
                hits = bits.cardinality(),
                "wildcard.bitset.fallback"
            );
            Arc::new(bits)
        } else {
            let mut bits = BitSet::new(reader.max_doc() as usize);
            for docs in clauses {
                for doc in docs {
                    bits.set(doc as usize);
                }
            }
            Arc::new(bits)
        };

        self.cache.lock().insert(key, Arc::clone(&bits));
        Ok(Hits {
            docs: bits.iter().map(|d| d as u32).collect(),
            score: SCORE,
        })
    }
}

/// Match-all query (`%`) over one field.
pub struct MatchAllQuery {
    field: String,
    format: IndexFormatVersion,
}

impl MatchAllQuery {
    /// Builds a match-all for `field` under the given index format.
    pub fn new(field: impl Into<String>, format: IndexFormatVersion) -> Self {
        Self {
            field: field.into(),
            format,
        }
    }

    /// Runs the query. Under `V2`+ this rewrites to a single term lookup
    /// against the properties-set field; under `V1` it enumerates the
    /// field's terms.
    pub fn execute(&self, reader: &ReadOnlyIndexReader) -> Result<Hits> {
        let mut docs: Vec<u32> = if self.format >= IndexFormatVersion::V2 {
            reader.term_docs(PROPERTIES_SET_FIELD, &self.field)
        } else {
            let mut all = Vec::new();
            for (_term, postings) in reader.terms(&self.field, None) {
                all.extend(postings);
            }
            all
        };
        docs.sort_unstable();
        docs.dedup();
        Ok(Hits { docs, score: SCORE })
    }
}

/// SQL LIKE matcher: `_` one char, `%` any run, `\` escapes.
pub struct LikeMatcher {
    pattern: Vec<LikeToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    Any,
    One,
    Literal(char),
}

impl LikeMatcher {
    /// Compiles a pattern.
    pub fn new(pattern: &str) -> Self {
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '%' => tokens.push(LikeToken::Any),
                '_' => tokens.push(LikeToken::One),
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        tokens.push(LikeToken::Literal(escaped));
                    }
                }
                other => tokens.push(LikeToken::Literal(other)),
            }
        }
        Self { pattern: tokens }
    }

    /// Tests `input` against the pattern.
    pub fn matches(&self, input: &str) -> bool {
        let input: Vec<char> = input.chars().collect();
        // Iterative two-pointer LIKE match with backtracking on `%`.
        let (mut i, mut p) = (0usize, 0usize);
        let mut star: Option<(usize, usize)> = None;
        while i < input.len() {
            match self.pattern.get(p) {
                Some(LikeToken::One) => {
                    i += 1;
                    p += 1;
                }
                Some(LikeToken::Literal(c)) if *c == input[i] => {
                    i += 1;
                    p += 1;
                }
                Some(LikeToken::Any) => {
                    star = Some((p, i));
                    p += 1;
                }
                _ => match star {
                    Some((sp, si)) => {
                        p = sp + 1;
                        i = si + 1;
                        star = Some((sp, si + 1));
                    }
                    None => return false,
                },
            }
        }
        while matches!(self.pattern.get(p), Some(LikeToken::Any)) {
            p += 1;
        }
        p == self.pattern.len()
    }
}
