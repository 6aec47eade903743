//! Sidecar metadata resolution along the BIDS inheritance principle.
//!
//! A sidecar applies to a data file when it lives in the same dataset, in
//! the file's own directory or an ancestor of it, names the same suffix, a
//! compatible datatype, and carries an entity map that is a subset of the
//! file's. Applicable sidecars merge shallowest-first, so deeper and more
//! specific sidecars override; within one directory and specificity the
//! lexicographically later filename wins. Merging is key-level: nested
//! objects are replaced, never recursed into.

use std::collections::HashMap;
use std::fs;

use serde_json::Value;
use tracing::{debug, warn};

use crate::construct::{EntityTable, LayoutIndex, TableHasher};
use crate::error::Result;
use crate::parse::ParsedPath;

/// Render a JSON value the way it participates in entity-like aggregation:
/// strings verbatim, everything else as compact JSON.
pub fn canonical_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Sidecar<'a> {
    record: &'a ParsedPath,
    dir: &'a str,
    values: serde_json::Map<String, Value>,
}

impl<'a> Sidecar<'a> {
    /// Does this sidecar apply to the target file per the inheritance rule?
    fn applies_to(&self, target: &ParsedPath) -> bool {
        if target.dataset != self.record.dataset {
            return false;
        }
        let target_dir = parent(&target.path);
        if !(target_dir == self.dir
            || (target_dir.starts_with(self.dir)
                && target_dir.as_bytes().get(self.dir.len()) == Some(&b'/')))
        {
            return false;
        }
        if self.record.suffix != target.suffix {
            return false;
        }
        if self.record.datatype.is_some() && self.record.datatype != target.datatype {
            return false;
        }
        self.record.entities.iter().all(|(key, value)| {
            target
                .entities
                .iter()
                .any(|(k, v)| k == key && v == value)
        })
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Resolved metadata for every file plus the layout-wide aggregation table.
pub struct MetadataIndex {
    resolved: HashMap<u64, HashMap<String, String>, TableHasher>,
    tables: EntityTable,
}

impl MetadataIndex {
    /// Walk every sidecar against every file and merge per the inheritance
    /// ordering. Unreadable or non-object sidecars are downgraded, never
    /// fatal.
    pub fn build(index: &LayoutIndex) -> Result<Self> {
        let mut sidecars: Vec<Sidecar> = Vec::new();
        for record in index.sidecars() {
            let contents = match fs::read_to_string(&record.path) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(path = %record.path, error = %err, "unreadable sidecar");
                    continue;
                }
            };
            let values = match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(map)) => map,
                Ok(..) => {
                    warn!(path = %record.path, "sidecar root is not a JSON object");
                    continue;
                }
                Err(err) => {
                    warn!(path = %record.path, error = %err, "unparseable sidecar");
                    continue;
                }
            };
            sidecars.push(Sidecar {
                record,
                dir: parent(&record.path),
                values,
            });
        }
        // Shallowest, least specific, lexicographically earliest first; a
        // later merge overrides an earlier one.
        sidecars.sort_by(|a, b| {
            let depth_a = a.dir.matches('/').count();
            let depth_b = b.dir.matches('/').count();
            depth_a
                .cmp(&depth_b)
                .then(a.record.entities.len().cmp(&b.record.entities.len()))
                .then_with(|| filename(&a.record.path).cmp(filename(&b.record.path)))
        });

        let mut resolved: HashMap<u64, HashMap<String, String>, TableHasher> =
            HashMap::default();
        for (id, file) in index.files().iter().enumerate() {
            let mut merged: HashMap<String, String> = HashMap::new();
            for sidecar in &sidecars {
                if sidecar.applies_to(file) {
                    for (key, value) in &sidecar.values {
                        merged.insert(key.clone(), canonical_form(value));
                    }
                }
            }
            if !merged.is_empty() {
                resolved.insert(id as u64, merged);
            }
        }

        debug!(
            sidecars = sidecars.len(),
            annotated = resolved.len(),
            "metadata indexed"
        );
        Ok(Self::from_resolved(resolved))
    }

    /// Rebuild from per-file maps restored out of a cache file.
    pub fn from_resolved(resolved: HashMap<u64, HashMap<String, String>, TableHasher>) -> Self {
        let mut tables = EntityTable::new();
        for (id, values) in &resolved {
            for (key, value) in values {
                tables.insert(key, value, *id);
            }
        }
        Self { resolved, tables }
    }

    pub fn tables(&self) -> &EntityTable {
        &self.tables
    }

    /// Resolved metadata for one file id.
    pub fn resolved(&self, id: u64) -> Option<&HashMap<String, String>> {
        self.resolved.get(&id)
    }

    pub fn all_resolved(&self) -> &HashMap<u64, HashMap<String, String>, TableHasher> {
        &self.resolved
    }
}
