//! The BIDS entity dictionary.
//!
//! A fixed table shipped with the crate maps every known entity between its
//! long form (`subject`) and short form (`sub`), assigns it a rank in the
//! canonical key order, and records where the entity may legally appear
//! (filename, directory, or both). The table is materialized once into a
//! [`bimap::BiMap`] so that the short/long correspondence is guaranteed to be
//! a bijection; a colliding table would fail at materialization rather than
//! produce silent mis-aliasing.

use bimap::BiMap;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use crate::error::{LayoutError, Result};

/// One row of the entity table.
#[derive(Debug, Clone, Copy)]
pub struct EntityDef {
    pub long: &'static str,
    pub short: &'static str,
    pub in_filename: bool,
    pub in_directory: bool,
}

const fn def(
    long: &'static str,
    short: &'static str,
    in_filename: bool,
    in_directory: bool,
) -> EntityDef {
    EntityDef {
        long,
        short,
        in_filename,
        in_directory,
    }
}

// Canonical order: the position of an entry doubles as its order rank, which
// drives `.entities` aggregation order and cache column order. The trailing
// datatype/suffix/extension rows are pseudo-entities recovered from path
// structure rather than key-value tokens.
const ENTITY_TABLE: &[EntityDef] = &[
    def("subject", "sub", true, true),
    def("session", "ses", true, true),
    def("sample", "sample", true, false),
    def("task", "task", true, false),
    def("tracksys", "tracksys", true, false),
    def("acquisition", "acq", true, false),
    def("ceagent", "ce", true, false),
    def("staining", "stain", true, false),
    def("tracer", "trc", true, false),
    def("reconstruction", "rec", true, false),
    def("direction", "dir", true, false),
    def("run", "run", true, false),
    def("modality", "mod", true, false),
    def("echo", "echo", true, false),
    def("flip", "flip", true, false),
    def("inv", "inv", true, false),
    def("mt", "mt", true, false),
    def("part", "part", true, false),
    def("proc", "proc", true, false),
    def("hemisphere", "hemi", true, false),
    def("space", "space", true, false),
    def("split", "split", true, false),
    def("recording", "recording", true, false),
    def("chunk", "chunk", true, false),
    def("atlas", "atlas", true, false),
    def("roi", "roi", true, false),
    def("label", "label", true, false),
    def("from", "from", true, false),
    def("to", "to", true, false),
    def("mode", "mode", true, false),
    def("res", "res", true, false),
    def("density", "den", true, false),
    def("model", "model", true, false),
    def("subset", "subset", true, false),
    def("description", "desc", true, false),
    def("datatype", "datatype", false, true),
    def("suffix", "suffix", true, false),
    def("extension", "extension", true, false),
];

/// Recognized datatype directory labels.
pub static DATATYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "anat", "beh", "dwi", "eeg", "fmap", "func", "ieeg", "meg", "micr", "motion", "nirs",
        "perf", "pet",
    ]
    .iter()
    .copied()
    .collect()
});

/// The materialized dictionary: bijective alias map plus rank lookup.
pub struct EntityDictionary {
    aliases: BiMap<&'static str, &'static str>,
    ranks: HashMap<&'static str, usize>,
    defs: &'static [EntityDef],
}

impl EntityDictionary {
    /// Materialize a table, rejecting any long- or short-name collision.
    pub fn from_table(defs: &'static [EntityDef]) -> Result<Self> {
        let mut aliases = BiMap::new();
        let mut ranks = HashMap::new();
        for (rank, entry) in defs.iter().enumerate() {
            if aliases.insert_no_overwrite(entry.short, entry.long).is_err() {
                return Err(LayoutError::UnknownEntity(format!(
                    "entity table collision on '{}'/'{}'",
                    entry.short, entry.long
                )));
            }
            ranks.insert(entry.long, rank);
        }
        Ok(Self {
            aliases,
            ranks,
            defs,
        })
    }

    /// Resolve a long or short name to the canonical long form.
    pub fn canonical(&self, key: &str) -> Option<&'static str> {
        if let Some(long) = self.aliases.get_by_left(key) {
            return Some(*long);
        }
        self.ranks.get_key_value(key).map(|(long, _)| *long)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.aliases.contains_left(key) || self.aliases.contains_right(key)
    }

    /// Rank of a long name in the canonical key order.
    pub fn rank(&self, long: &str) -> Option<usize> {
        self.ranks.get(long).copied()
    }

    pub fn defs(&self) -> &'static [EntityDef] {
        self.defs
    }

    /// True when the entity may appear as a directory component.
    pub fn permitted_in_directory(&self, long: &str) -> bool {
        self.ranks
            .get(long)
            .map(|rank| self.defs[*rank].in_directory)
            .unwrap_or(false)
    }
}

pub static DICTIONARY: Lazy<EntityDictionary> = Lazy::new(|| {
    EntityDictionary::from_table(ENTITY_TABLE).expect("builtin entity table is collision-free")
});

/// Map a long entity name to its short form.
pub fn long_to_short(name: &str) -> Result<&'static str> {
    DICTIONARY
        .aliases
        .get_by_right(name)
        .copied()
        .ok_or_else(|| LayoutError::UnknownEntity(name.to_string()))
}

/// Map a short entity name to its long form.
pub fn short_to_long(name: &str) -> Result<&'static str> {
    DICTIONARY
        .aliases
        .get_by_left(name)
        .copied()
        .ok_or_else(|| LayoutError::UnknownEntity(name.to_string()))
}

/// Sort entity long names into canonical order; names outside the dictionary
/// follow the known ones, alphabetically.
pub fn canonical_sort(names: &mut [String]) {
    names.sort_by(|a, b| {
        let ra = DICTIONARY.rank(a);
        let rb = DICTIONARY.rank(b);
        match (ra, rb) {
            (Some(ra), Some(rb)) => ra.cmp(&rb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    });
}

/// True when the label names a BIDS datatype directory.
pub fn is_datatype(label: &str) -> bool {
    DATATYPES.contains(label)
}
