//! Filesystem enumeration.
//!
//! Root specifications are resolved into a dataset table first; files are
//! then enumerated with one worker thread per dataset, streaming parsed
//! records over a bounded channel into a single collector. Cancellation is
//! cooperative through a shared [`CancelToken`] consulted as the walk
//! advances; a cancelled walk surfaces `Interrupted` and no partial index
//! ever escapes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::dataset::{discover_derivatives, Dataset, DatasetKind, DerivativesSpec};
use crate::error::{LayoutError, Result};
use crate::parse::{self, ParseMode, ParsedPath};

/// Cancellation token shared with walker threads.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn canonicalize(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .map_err(|err| LayoutError::io(path, err))?;
    canonical
        .into_os_string()
        .into_string()
        .map_err(|os| LayoutError::io(path, std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("path is not valid unicode: {}", os.to_string_lossy()),
        )))
}

/// Resolve root specifications and the derivatives configuration into the
/// dataset table. Roots are canonicalized with symlink resolution; two
/// specifications resolving to the same directory are rejected.
pub fn resolve_datasets<P: AsRef<Path>>(
    roots: &[P],
    derivatives: &DerivativesSpec,
) -> Result<Vec<Dataset>> {
    fn push(
        datasets: &mut Vec<Dataset>,
        seen: &mut HashSet<String>,
        root: String,
        kind: DatasetKind,
        label: Option<String>,
    ) -> Result<()> {
        if !seen.insert(root.clone()) {
            return Err(LayoutError::DuplicateRoot(PathBuf::from(root)));
        }
        datasets.push(Dataset::from_root(root, kind, label));
        Ok(())
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut datasets = Vec::new();

    for root in roots {
        push(
            &mut datasets,
            &mut seen,
            canonicalize(root.as_ref())?,
            DatasetKind::Raw,
            None,
        )?;
    }
    match derivatives {
        DerivativesSpec::None => {}
        DerivativesSpec::Auto => {
            let raw_roots: Vec<String> = datasets.iter().map(|d| d.root.clone()).collect();
            for raw in raw_roots {
                for (label, path) in discover_derivatives(Path::new(&raw))? {
                    push(
                        &mut datasets,
                        &mut seen,
                        canonicalize(&path)?,
                        DatasetKind::Derivative,
                        Some(label),
                    )?;
                }
            }
        }
        DerivativesSpec::Paths(paths) => {
            for path in paths {
                push(
                    &mut datasets,
                    &mut seen,
                    canonicalize(path)?,
                    DatasetKind::Derivative,
                    None,
                )?;
            }
        }
        DerivativesSpec::Labeled(labelled) => {
            for (label, path) in labelled {
                push(
                    &mut datasets,
                    &mut seen,
                    canonicalize(path)?,
                    DatasetKind::Derivative,
                    Some(label.clone()),
                )?;
            }
        }
    }
    Ok(datasets)
}

fn hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// Enumerate one dataset, streaming parsed records into the channel. Nested
/// dataset roots are excluded from this dataset's walk; they belong to the
/// inner dataset only.
fn walk_dataset(
    dataset: &Dataset,
    id: u32,
    mode: ParseMode,
    nested: &HashSet<PathBuf>,
    cancel: &CancelToken,
    tx: &SyncSender<Result<ParsedPath>>,
) {
    let root = Path::new(&dataset.root);
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || (!hidden(entry.file_name()) && !nested.contains(entry.path()))
        });
    for entry in walker {
        if cancel.is_cancelled() {
            let _ = tx.send(Err(LayoutError::Interrupted));
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // An unreadable root aborts construction; anything deeper
                // downgrades to a skipped subtree.
                if err.path() == Some(root) || err.depth() == 0 {
                    let io = err.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "walk failed")
                    });
                    let _ = tx.send(Err(LayoutError::io(root, io)));
                    return;
                }
                warn!(dataset = %dataset.root, error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() == "dataset_description.json" {
            continue;
        }
        let Some(path) = entry.path().to_str() else {
            warn!(path = %entry.path().display(), "skipping non-unicode path");
            continue;
        };
        let parsed = match parse::parse(path, id, dataset.root.len(), mode) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path, error = %err, "demoting file to parts-only record");
                ParsedPath::parts_only(path, id, dataset.root.len())
            }
        };
        if tx.send(Ok(parsed)).is_err() {
            return;
        }
    }
}

/// Enumerate every dataset, fanning directory walks out across worker
/// threads and merging parsed records through a bounded channel.
pub fn enumerate(
    datasets: &[Dataset],
    mode: ParseMode,
    cancel: &CancelToken,
) -> Result<Vec<ParsedPath>> {
    // Roots nested inside another dataset are carved out of the outer walk.
    let nested_per_dataset: Vec<HashSet<PathBuf>> = datasets
        .iter()
        .map(|outer| {
            datasets
                .iter()
                .filter(|inner| {
                    inner.root != outer.root
                        && Path::new(&inner.root).starts_with(&outer.root)
                })
                .map(|inner| PathBuf::from(&inner.root))
                .collect()
        })
        .collect();

    let (tx, rx) = mpsc::sync_channel::<Result<ParsedPath>>(1024);
    let mut files = Vec::new();
    thread::scope(|scope| -> Result<()> {
        for (id, dataset) in datasets.iter().enumerate() {
            let tx = tx.clone();
            let nested = &nested_per_dataset[id];
            let cancel = cancel.clone();
            scope.spawn(move || {
                walk_dataset(dataset, id as u32, mode, nested, &cancel, &tx);
            });
        }
        drop(tx);
        for message in rx {
            files.push(message?);
        }
        Ok(())
    })?;
    if cancel.is_cancelled() {
        return Err(LayoutError::Interrupted);
    }
    debug!(files = files.len(), datasets = datasets.len(), "walk complete");
    Ok(files)
}
