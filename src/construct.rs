//! The master in-memory structure: datasets, parsed files and the entity
//! tables that back query evaluation.
//!
//! The index is assembled once (from a walk or from a cache file) and never
//! mutated afterwards, with one exception that goes through a one-shot
//! cell: the metadata tables produced by `index_metadata()`. Views share
//! the index through `Arc` and carry only a selection.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use once_cell::sync::OnceCell;
use roaring::RoaringTreemap;
use seahash::SeaHasher;

use crate::dataset::Dataset;
use crate::error::Result;
use crate::metadata::MetadataIndex;
use crate::parse::{ParseMode, ParsedPath};

pub type TableHasher = BuildHasherDefault<SeaHasher>;

/// `entity -> value -> bitmap of file ids`. Doubles as the inverted index
/// for filtering and as the source for `.entities` aggregation.
#[derive(Debug, Default, Clone)]
pub struct EntityTable {
    kept: HashMap<String, HashMap<String, RoaringTreemap, TableHasher>, TableHasher>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: &str, value: &str, id: u64) {
        self.kept
            .entry(entity.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(id);
    }

    pub fn get(&self, entity: &str) -> Option<&HashMap<String, RoaringTreemap, TableHasher>> {
        self.kept.get(entity)
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.kept.contains_key(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &String> {
        self.kept.keys()
    }

    /// Union of every value bitmap: the ids where the entity is present.
    pub fn presence(&self, entity: &str) -> RoaringTreemap {
        let mut present = RoaringTreemap::new();
        if let Some(values) = self.kept.get(entity) {
            for bitmap in values.values() {
                present |= bitmap;
            }
        }
        present
    }

    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

/// The owning index behind every layout view.
///
/// Sidecar JSON files are kept in their own table: they carry metadata for
/// data files rather than standing as query results themselves, so the
/// selection space covers `files` only.
pub struct LayoutIndex {
    datasets: Vec<Dataset>,
    files: Vec<ParsedPath>,
    sidecars: Vec<ParsedPath>,
    mode: ParseMode,
    tables: EntityTable,
    dataset_masks: Vec<RoaringTreemap>,
    metadata: OnceCell<MetadataIndex>,
}

impl LayoutIndex {
    /// Assemble the index from a dataset table and parsed records,
    /// separating sidecars and populating the entity tables and per-dataset
    /// membership bitmaps.
    pub fn from_parts(datasets: Vec<Dataset>, records: Vec<ParsedPath>, mode: ParseMode) -> Self {
        let (sidecars, mut files): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| record.extension.as_deref() == Some(".json"));
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let mut tables = EntityTable::new();
        let mut dataset_masks = vec![RoaringTreemap::new(); datasets.len()];
        for (id, file) in files.iter().enumerate() {
            let id = id as u64;
            for (entity, value) in &file.entities {
                tables.insert(entity, value, id);
            }
            if let Some(datatype) = &file.datatype {
                tables.insert("datatype", datatype, id);
            }
            if let Some(suffix) = &file.suffix {
                tables.insert("suffix", suffix, id);
            }
            if let Some(extension) = &file.extension {
                tables.insert("extension", extension, id);
            }
            if let Some(mask) = dataset_masks.get_mut(file.dataset as usize) {
                mask.insert(id);
            }
        }
        Self {
            datasets,
            files,
            sidecars,
            mode,
            tables,
            dataset_masks,
            metadata: OnceCell::new(),
        }
    }

    /// Data files, id order = ascending path order.
    pub fn files(&self) -> &[ParsedPath] {
        &self.files
    }

    /// Sidecar JSON records, reachable through metadata resolution only.
    pub fn sidecars(&self) -> &[ParsedPath] {
        &self.sidecars
    }

    pub fn file(&self, id: u64) -> &ParsedPath {
        &self.files[id as usize]
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn dataset(&self, id: u32) -> &Dataset {
        &self.datasets[id as usize]
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    pub fn tables(&self) -> &EntityTable {
        &self.tables
    }

    pub fn dataset_mask(&self, id: u32) -> &RoaringTreemap {
        &self.dataset_masks[id as usize]
    }

    /// Bitmap covering every file id.
    pub fn full_mask(&self) -> RoaringTreemap {
        (0..self.files.len() as u64).collect()
    }

    pub fn metadata(&self) -> Option<&MetadataIndex> {
        self.metadata.get()
    }

    /// Resolve sidecar metadata for every file. Idempotent; concurrent
    /// callers block on the cell and then observe the populated index.
    pub fn index_metadata(&self) -> Result<&MetadataIndex> {
        self.metadata.get_or_try_init(|| MetadataIndex::build(self))
    }

    /// Install a metadata index restored from a cache file. Returns false if
    /// metadata had already been resolved.
    pub fn restore_metadata(&self, metadata: MetadataIndex) -> bool {
        self.metadata.set(metadata).is_ok()
    }
}
