//! Layout views: the public query surface.
//!
//! A [`Layout`] is an immutable projection over a shared [`LayoutIndex`]:
//! the index plus a selection bitset and the set of dataset ids the view
//! declares. Every query operation returns a new view over the same index,
//! so views chain freely and share the index for as long as any of them is
//! alive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roaring::RoaringTreemap;
use tracing::{debug, warn};

use crate::construct::LayoutIndex;
use crate::dataset::{Dataset, DatasetDescription, DatasetKind, DerivativesSpec};
use crate::entity;
use crate::error::{LayoutError, Result};
use crate::parse::{self, ParseMode, ParsedPath};
use crate::persist;
use crate::query::{self, EntityQuery, Selection};
use crate::walk::{self, CancelToken};

/// Construction-time options.
#[derive(Debug, Clone, Default)]
pub struct LayoutOptions {
    pub derivatives: DerivativesSpec,
    /// Strict dictionary parsing when set; permissive otherwise.
    pub validate: bool,
    /// Cache file consulted before walking and refreshed afterwards.
    pub cache: Option<PathBuf>,
    /// Ignore an existing cache file and rebuild.
    pub reset_cache: bool,
    pub cancel: Option<CancelToken>,
}

/// One indexed file as seen through a view.
#[derive(Clone, Copy)]
pub struct FileView<'a> {
    index: &'a LayoutIndex,
    id: u64,
}

impl std::fmt::Debug for FileView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileView").field("path", &self.path()).finish()
    }
}

impl<'a> FileView<'a> {
    pub fn path(&self) -> &'a str {
        &self.index.file(self.id).path
    }

    pub fn parsed(&self) -> &'a ParsedPath {
        self.index.file(self.id)
    }

    pub fn dataset(&self) -> &'a Dataset {
        self.index.dataset(self.index.file(self.id).dataset)
    }

    /// Value of one entity by long or short name.
    pub fn entity(&self, key: &str) -> Option<&'a str> {
        self.index.file(self.id).entity(key)
    }

    /// Resolved sidecar metadata, if `index_metadata()` has run.
    pub fn metadata(&self) -> Option<&'a HashMap<String, String>> {
        self.index.metadata().and_then(|m| m.resolved(self.id))
    }
}

/// An immutable view over an indexed set of BIDS datasets.
#[derive(Clone)]
pub struct Layout {
    index: Arc<LayoutIndex>,
    selection: Selection,
    datasets: Vec<u32>,
}

impl Layout {
    /// Index one or more dataset roots with default options.
    pub fn open<P: AsRef<Path>>(roots: &[P]) -> Result<Self> {
        Self::open_with(roots, LayoutOptions::default())
    }

    /// Index one or more dataset roots.
    ///
    /// When a cache file is configured and matches the requested dataset
    /// table, the walk is skipped entirely; otherwise the roots are walked
    /// and the cache rewritten.
    pub fn open_with<P: AsRef<Path>>(roots: &[P], options: LayoutOptions) -> Result<Self> {
        let datasets = walk::resolve_datasets(roots, &options.derivatives)?;
        let mode = if options.validate {
            ParseMode::Strict
        } else {
            ParseMode::Permissive
        };
        if let Some(cache) = &options.cache {
            if !options.reset_cache && cache.is_file() {
                match persist::load(cache) {
                    Ok(index) if persist::matches_request(&index, &datasets, mode) => {
                        debug!(cache = %cache.display(), "layout restored from cache");
                        return Ok(Self::from_index(Arc::new(index)));
                    }
                    Ok(..) => {
                        debug!(cache = %cache.display(), "cache does not match request; rebuilding");
                    }
                    Err(err) => {
                        warn!(cache = %cache.display(), error = %err, "discarding unusable cache");
                    }
                }
            }
        }
        let cancel = options.cancel.clone().unwrap_or_default();
        let records = walk::enumerate(&datasets, mode, &cancel)?;
        let index = LayoutIndex::from_parts(datasets, records, mode);
        if let Some(cache) = &options.cache {
            persist::save(&index, cache)?;
        }
        Ok(Self::from_index(Arc::new(index)))
    }

    fn from_index(index: Arc<LayoutIndex>) -> Self {
        let selection = Selection::from_bitmap(index.full_mask());
        let datasets = (0..index.datasets().len() as u32).collect();
        Self {
            index,
            selection,
            datasets,
        }
    }

    /// Load a layout from a cache file written by [`Layout::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_index(Arc::new(persist::load(path.as_ref())?)))
    }

    /// Serialize the full underlying index to a cache file. Views share one
    /// index, so saving through any view writes the complete layout.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        persist::save(&self.index, path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.selection.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.selection.is_empty()
    }

    /// Filter on entities and indexed metadata keys. Keys AND-compose;
    /// values within one key union.
    pub fn get(&self, query: &EntityQuery) -> Result<Self> {
        let selection = query::evaluate(&self.index, query, &self.selection)?;
        let datasets = self.project_datasets(&selection);
        Ok(Self {
            index: Arc::clone(&self.index),
            selection,
            datasets,
        })
    }

    /// Filter on dataset attributes: `root` patterns (exact or glob) and
    /// `scope` tokens (`raw`/`self`, `derivatives`, label, pipeline).
    pub fn filter(&self, root: Option<&[&str]>, scope: Option<&[&str]>) -> Result<Self> {
        let mut ids: Vec<u32> = self.datasets.clone();
        if let Some(scopes) = scope {
            let matched = query::filter_scopes(&self.index, scopes)?;
            ids.retain(|id| matched.contains(id));
        }
        if let Some(patterns) = root {
            let matched = query::filter_roots(&self.index, patterns)?;
            ids.retain(|id| matched.contains(id));
        }
        Ok(self.restrict_to_datasets(ids))
    }

    /// The view over datasets of kind derivative; empty when none are
    /// declared.
    pub fn derivatives(&self) -> Self {
        let ids: Vec<u32> = self
            .datasets
            .iter()
            .copied()
            .filter(|id| self.index.dataset(*id).kind == DatasetKind::Derivative)
            .collect();
        self.restrict_to_datasets(ids)
    }

    fn restrict_to_datasets(&self, ids: Vec<u32>) -> Self {
        let mut mask = RoaringTreemap::new();
        for id in &ids {
            mask |= self.index.dataset_mask(*id);
        }
        let mut selection = self.selection.clone();
        selection.intersect_with(&Selection::Many(mask));
        Self {
            index: Arc::clone(&self.index),
            selection,
            datasets: ids,
        }
    }

    /// Declared dataset ids still referenced by the selection, in order.
    fn project_datasets(&self, selection: &Selection) -> Vec<u32> {
        let mut referenced: Vec<u32> = Vec::new();
        for id in selection.iter() {
            let dataset = self.index.file(id).dataset;
            if !referenced.contains(&dataset) {
                referenced.push(dataset);
            }
        }
        self.datasets
            .iter()
            .copied()
            .filter(|id| referenced.contains(id))
            .collect()
    }

    /// Canonical roots of the datasets referenced by the selection.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = Vec::new();
        for id in &self.datasets {
            let root = self.index.dataset(*id).root.as_str();
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }

    /// The unique root dataset: the sole raw dataset if exactly one is
    /// declared, otherwise the sole derivative dataset if no raw dataset
    /// remains.
    pub fn root(&self) -> Result<&Dataset> {
        let of_kind = |kind: DatasetKind| -> Vec<&Dataset> {
            self.datasets
                .iter()
                .map(|id| self.index.dataset(*id))
                .filter(|dataset| dataset.kind == kind)
                .collect()
        };
        let raw = of_kind(DatasetKind::Raw);
        match raw.len() {
            1 => return Ok(raw[0]),
            0 => {}
            n => return Err(LayoutError::AmbiguousRoot(n)),
        }
        let derivative = of_kind(DatasetKind::Derivative);
        match derivative.len() {
            1 => Ok(derivative[0]),
            0 => Err(LayoutError::NoRoot),
            n => Err(LayoutError::AmbiguousRoot(n)),
        }
    }

    /// Description of the unique root dataset; `BadDescription` if its
    /// description file existed but could not be parsed.
    pub fn description(&self) -> Result<Option<&DatasetDescription>> {
        self.root()?.description()
    }

    /// Entity long names mapped to the sorted unique values present in the
    /// selection, in canonical key order.
    pub fn entities(&self) -> Vec<(String, Vec<String>)> {
        self.aggregate(self.index.tables())
    }

    /// Same aggregation over resolved metadata keys; empty until
    /// `index_metadata()` has run.
    pub fn metadata(&self) -> Vec<(String, Vec<String>)> {
        match self.index.metadata() {
            Some(metadata) => self.aggregate(metadata.tables()),
            None => Vec::new(),
        }
    }

    fn aggregate(&self, table: &crate::construct::EntityTable) -> Vec<(String, Vec<String>)> {
        let mut names: Vec<String> = table.entities().cloned().collect();
        entity::canonical_sort(&mut names);
        let mut aggregated = Vec::new();
        for name in names {
            let Some(values) = table.get(&name) else {
                continue;
            };
            let mut present: Vec<String> = values
                .iter()
                .filter(|(_, bitmap)| self.selection.iter().any(|id| bitmap.contains(id)))
                .map(|(value, _)| value.clone())
                .collect();
            if !present.is_empty() {
                present.sort();
                aggregated.push((name, present));
            }
        }
        aggregated
    }

    /// The sole file of a singleton view. On a larger view the error names
    /// the entities whose values still vary.
    pub fn one(&self) -> Result<FileView<'_>> {
        match self.selection.len() {
            1 => Ok(FileView {
                index: &self.index,
                id: self.selection.iter().next().unwrap_or_default(),
            }),
            0 => Err(LayoutError::NotUnique(Vec::new())),
            _ => {
                let varying = self
                    .entities()
                    .into_iter()
                    .filter(|(_, values)| values.len() > 1)
                    .map(|(name, _)| name)
                    .collect();
                Err(LayoutError::NotUnique(varying))
            }
        }
    }

    /// Iterate the selection in ascending path order.
    pub fn iter(&self) -> impl Iterator<Item = FileView<'_>> + '_ {
        self.selection.iter().map(move |id| FileView {
            index: &self.index,
            id,
        })
    }

    /// Parse an ad-hoc path against this layout's datasets without adding
    /// it to the index.
    pub fn parse(&self, path: &str) -> Result<ParsedPath> {
        let dataset = self
            .index
            .datasets()
            .iter()
            .enumerate()
            .filter(|(_, dataset)| {
                path == dataset.root
                    || (path.starts_with(&dataset.root)
                        && path.as_bytes().get(dataset.root.len()) == Some(&b'/'))
            })
            // Nested datasets: prefer the innermost (longest) root.
            .max_by_key(|(_, dataset)| dataset.root.len());
        let (id, dataset) = dataset.ok_or_else(|| LayoutError::NotInRoot(PathBuf::from(path)))?;
        parse::parse(path, id as u32, dataset.root.len(), self.index.mode())
    }

    /// Resolve sidecar metadata for every indexed file. Idempotent: the
    /// first caller performs the walk, everyone else reuses it.
    pub fn index_metadata(&self) -> Result<Self> {
        self.index.index_metadata()?;
        Ok(self.clone())
    }
}

impl std::fmt::Debug for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layout")
            .field("len", &self.len())
            .field("datasets", &self.datasets)
            .finish()
    }
}
