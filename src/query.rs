//! Query evaluation: compact selections and the filters that produce them.
//!
//! Selections use a tri-state representation so that the common cases (no
//! hits, exactly one hit) never allocate a bitmap. Entity and metadata
//! filters reduce to one bitmap per key which is intersected with the
//! current view's selection; dataset-level filters additionally restrict the
//! view's dataset-id set.

use std::collections::HashSet;
use std::ops::{BitAndAssign, BitOrAssign};

use globset::{GlobBuilder, GlobSetBuilder};
use itertools::Itertools;
use roaring::RoaringTreemap;

use crate::construct::{EntityTable, LayoutIndex, TableHasher};
use crate::dataset::DatasetKind;
use crate::entity::DICTIONARY;
use crate::error::{LayoutError, Result};

/// Compact set of file ids used during query evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Empty,
    Single(u64),
    Many(RoaringTreemap),
}

impl Selection {
    pub fn new() -> Self {
        Selection::Empty
    }

    /// Normalize a bitmap into the smallest representation.
    pub fn from_bitmap(bitmap: RoaringTreemap) -> Self {
        match bitmap.len() {
            0 => Selection::Empty,
            1 => Selection::Single(bitmap.min().unwrap_or_default()),
            _ => Selection::Many(bitmap),
        }
    }

    pub fn insert(&mut self, id: u64) {
        match self {
            Selection::Empty => *self = Selection::Single(id),
            Selection::Single(existing) => {
                if *existing != id {
                    let mut bitmap = RoaringTreemap::new();
                    bitmap.insert(*existing);
                    bitmap.insert(id);
                    *self = Selection::Many(bitmap);
                }
            }
            Selection::Many(bitmap) => {
                bitmap.insert(id);
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Selection::Empty => 0,
            Selection::Single(..) => 1,
            Selection::Many(bitmap) => bitmap.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Selection::Empty)
    }

    pub fn contains(&self, id: u64) -> bool {
        match self {
            Selection::Empty => false,
            Selection::Single(existing) => *existing == id,
            Selection::Many(bitmap) => bitmap.contains(id),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        match self {
            Selection::Empty => Box::new(std::iter::empty()),
            Selection::Single(id) => Box::new(std::iter::once(*id)),
            Selection::Many(bitmap) => Box::new(bitmap.iter()),
        }
    }

    fn intersect_bitmap(&mut self, other: &RoaringTreemap) {
        match self {
            Selection::Empty => {}
            Selection::Single(id) => {
                if !other.contains(*id) {
                    *self = Selection::Empty;
                }
            }
            Selection::Many(bitmap) => {
                *bitmap &= other;
                let reduced = std::mem::take(bitmap);
                *self = Selection::from_bitmap(reduced);
            }
        }
    }

    pub fn intersect_with(&mut self, other: &Selection) {
        match other {
            Selection::Empty => *self = Selection::Empty,
            Selection::Single(id) => {
                *self = if self.contains(*id) {
                    Selection::Single(*id)
                } else {
                    Selection::Empty
                };
            }
            Selection::Many(bitmap) => self.intersect_bitmap(bitmap),
        }
    }

    pub fn union_with(&mut self, other: &Selection) {
        match other {
            Selection::Empty => {}
            Selection::Single(id) => self.insert(*id),
            Selection::Many(other_bitmap) => {
                let mut bitmap = match std::mem::replace(self, Selection::Empty) {
                    Selection::Empty => RoaringTreemap::new(),
                    Selection::Single(id) => {
                        let mut bitmap = RoaringTreemap::new();
                        bitmap.insert(id);
                        bitmap
                    }
                    Selection::Many(bitmap) => bitmap,
                };
                bitmap |= other_bitmap;
                *self = Selection::from_bitmap(bitmap);
            }
        }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Selection::Empty
    }
}

impl BitAndAssign<&'_ Selection> for Selection {
    fn bitand_assign(&mut self, rhs: &Selection) {
        self.intersect_with(rhs);
    }
}

impl BitOrAssign<&'_ Selection> for Selection {
    fn bitor_assign(&mut self, rhs: &Selection) {
        self.union_with(rhs);
    }
}

impl FromIterator<u64> for Selection {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Selection::from_bitmap(iter.into_iter().collect())
    }
}

/// One term of an entity filter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTerm {
    /// `true`: entity present with any value; `false`: entity absent.
    Bool(bool),
    /// Exact string match.
    Value(String),
    /// Integer coercion: matches any zero-padded decimal form of the value.
    Index(u64),
}

impl From<bool> for QueryTerm {
    fn from(value: bool) -> Self {
        QueryTerm::Bool(value)
    }
}

impl From<&str> for QueryTerm {
    fn from(value: &str) -> Self {
        QueryTerm::Value(value.to_string())
    }
}

impl From<String> for QueryTerm {
    fn from(value: String) -> Self {
        QueryTerm::Value(value)
    }
}

impl From<u64> for QueryTerm {
    fn from(value: u64) -> Self {
        QueryTerm::Index(value)
    }
}

impl From<i32> for QueryTerm {
    fn from(value: i32) -> Self {
        QueryTerm::Index(value.unsigned_abs() as u64)
    }
}

/// An AND-composed set of entity filters; terms within one key are OR-ed.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    terms: Vec<(String, Vec<QueryTerm>)>,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-term filter for `key`.
    pub fn with(mut self, key: &str, term: impl Into<QueryTerm>) -> Self {
        self.terms.push((key.to_string(), vec![term.into()]));
        self
    }

    /// Add a multi-term (OR) filter for `key`.
    pub fn with_any<T: Into<QueryTerm>>(
        mut self,
        key: &str,
        terms: impl IntoIterator<Item = T>,
    ) -> Self {
        self.terms
            .push((key.to_string(), terms.into_iter().map_into().collect()));
        self
    }

    pub fn terms(&self) -> &[(String, Vec<QueryTerm>)] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Build an [`EntityQuery`] with keyword-argument flavor:
///
/// ```
/// use broca::entity_query;
/// let q = entity_query!("subject": "01", "run": 1, "suffix": ["bold", "T1w"]);
/// ```
#[macro_export]
macro_rules! entity_query {
    () => { $crate::query::EntityQuery::new() };
    ($($key:literal : $value:tt),+ $(,)?) => {{
        let query = $crate::query::EntityQuery::new();
        $(let query = $crate::entity_query!(@term query, $key, $value);)+
        query
    }};
    (@term $query:ident, $key:literal, [$($value:expr),+ $(,)?]) => {
        $query.with_any($key, vec![$($crate::query::QueryTerm::from($value)),+])
    };
    (@term $query:ident, $key:literal, $value:expr) => {
        $query.with($key, $value)
    };
}

enum KeyTarget {
    Entity(String),
    Metadata(String),
}

/// Resolve a query key: long name, short name, trailing-underscore-stripped
/// variant, an already-indexed unknown-entity column, or an indexed metadata
/// key — in that order.
fn resolve_key(index: &LayoutIndex, raw: &str) -> Result<KeyTarget> {
    let stripped = raw.strip_suffix('_').unwrap_or(raw);
    if let Some(long) = DICTIONARY.canonical(stripped) {
        return Ok(KeyTarget::Entity(long.to_string()));
    }
    if index.tables().contains(stripped) {
        return Ok(KeyTarget::Entity(stripped.to_string()));
    }
    if let Some(metadata) = index.metadata() {
        if metadata.tables().contains(stripped) {
            return Ok(KeyTarget::Metadata(stripped.to_string()));
        }
    }
    Err(LayoutError::UnknownEntity(raw.to_string()))
}

/// Candidate raw forms matched by an integer term, with their bitmaps.
fn index_candidates(
    values: &std::collections::HashMap<String, RoaringTreemap, TableHasher>,
    wanted: u64,
) -> Vec<(String, RoaringTreemap)> {
    values
        .iter()
        .filter(|(value, _)| {
            !value.is_empty()
                && value.bytes().all(|b| b.is_ascii_digit())
                && value.parse::<u64>().map(|n| n == wanted).unwrap_or(false)
        })
        .map(|(value, bitmap)| (value.clone(), bitmap.clone()))
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .collect()
}

/// Evaluate an entity/metadata query against the current selection.
pub(crate) fn evaluate(
    index: &LayoutIndex,
    query: &EntityQuery,
    current: &Selection,
) -> Result<Selection> {
    let mut selection = current.clone();
    // Integer coercions are re-checked against the final selection: a filter
    // that still matches several distinct raw forms is ambiguous.
    let mut coercions: Vec<(String, Vec<(String, RoaringTreemap)>)> = Vec::new();

    let empty = EntityTable::new();
    for (raw_key, terms) in query.terms() {
        let target = resolve_key(index, raw_key)?;
        let (key, table) = match &target {
            KeyTarget::Entity(key) => (key, index.tables()),
            KeyTarget::Metadata(key) => (
                key,
                index.metadata().map(|m| m.tables()).unwrap_or(&empty),
            ),
        };
        let values = table.get(key);
        let mut matched = RoaringTreemap::new();
        for term in terms {
            match term {
                QueryTerm::Bool(true) => {
                    let present = table.presence(key);
                    matched |= &present;
                }
                QueryTerm::Bool(false) => {
                    let mut absent = index.full_mask();
                    absent -= &table.presence(key);
                    matched |= &absent;
                }
                QueryTerm::Value(value) => {
                    if let Some(bitmap) = values.and_then(|v| v.get(value)) {
                        matched |= bitmap;
                    }
                }
                QueryTerm::Index(wanted) => {
                    let candidates = values
                        .map(|v| index_candidates(v, *wanted))
                        .unwrap_or_default();
                    for (_, bitmap) in &candidates {
                        matched |= bitmap;
                    }
                    coercions.push((key.clone(), candidates));
                }
            }
        }
        selection.intersect_bitmap(&matched);
    }

    for (_, candidates) in &coercions {
        let surviving: Vec<&String> = candidates
            .iter()
            .filter(|(_, bitmap)| selection.iter().any(|id| bitmap.contains(id)))
            .map(|(value, _)| value)
            .collect();
        if surviving.len() > 1 {
            return Err(LayoutError::NotUnique(
                surviving.into_iter().cloned().collect(),
            ));
        }
    }
    Ok(selection)
}

/// Resolve `root=` patterns to dataset ids. Exact matches are checked first
/// so paths with glob metacharacters in them keep working; everything else
/// goes through shell-style glob matching on the canonical root.
pub(crate) fn filter_roots(index: &LayoutIndex, patterns: &[&str]) -> Result<Vec<u32>> {
    let mut exact: HashSet<&str> = HashSet::new();
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if index.datasets().iter().any(|d| d.root == *pattern) {
            exact.insert(*pattern);
        } else {
            // Shell semantics: `*` stays within one path component, `**`
            // spans components.
            builder.add(
                GlobBuilder::new(pattern)
                    .literal_separator(true)
                    .build()?,
            );
        }
    }
    let globs = builder.build()?;
    Ok(index
        .datasets()
        .iter()
        .enumerate()
        .filter(|(_, dataset)| {
            exact.contains(dataset.root.as_str()) || globs.is_match(&dataset.root)
        })
        .map(|(id, _)| id as u32)
        .collect())
}

/// Resolve `scope=` tokens to dataset ids. Resolution order: raw/self,
/// derivatives, derivative label, pipeline name. A token matching nothing is
/// an `UnknownScope` error.
pub(crate) fn filter_scopes(index: &LayoutIndex, scopes: &[&str]) -> Result<Vec<u32>> {
    let datasets = index.datasets();
    let mut selected: Vec<u32> = Vec::new();
    let push = |id: u32, selected: &mut Vec<u32>| {
        if !selected.contains(&id) {
            selected.push(id);
        }
    };
    for scope in scopes {
        match *scope {
            "raw" | "self" => {
                for (id, dataset) in datasets.iter().enumerate() {
                    if dataset.kind == DatasetKind::Raw {
                        push(id as u32, &mut selected);
                    }
                }
            }
            "derivatives" => {
                for (id, dataset) in datasets.iter().enumerate() {
                    if dataset.kind == DatasetKind::Derivative {
                        push(id as u32, &mut selected);
                    }
                }
            }
            token => {
                let by_label: Vec<u32> = datasets
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.label.as_deref() == Some(token))
                    .map(|(id, _)| id as u32)
                    .collect();
                let matched = if by_label.is_empty() {
                    datasets
                        .iter()
                        .enumerate()
                        .filter(|(_, d)| d.pipelines.iter().any(|p| p == token))
                        .map(|(id, _)| id as u32)
                        .collect()
                } else {
                    by_label
                };
                if matched.is_empty() {
                    return Err(LayoutError::UnknownScope(token.to_string()));
                }
                for id in matched {
                    push(id, &mut selected);
                }
            }
        }
    }
    Ok(selected)
}
