//! Datasets and their self-description.
//!
//! A dataset is a directory carrying a `dataset_description.json` (or a
//! declared root without one). Raw roots are named by the caller; derivative
//! datasets come in through the polymorphic `derivatives` argument, which is
//! normalized here into a single tagged shape before any walking happens.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LayoutError, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedBy {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "CodeURL")]
    pub code_url: Option<String>,
    #[serde(rename = "Container")]
    pub container: Option<serde_json::Value>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDataset {
    #[serde(rename = "URI")]
    pub uri: Option<String>,
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
    #[serde(rename = "Version")]
    pub version: Option<String>,
}

/// The recognized subset of `dataset_description.json`. Unknown fields are
/// ignored on deserialization.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetDescription {
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "BIDSVersion")]
    pub bids_version: Option<String>,
    #[serde(rename = "HEDVersion")]
    pub hed_version: Option<serde_json::Value>,
    #[serde(rename = "DatasetLinks")]
    pub dataset_links: Option<HashMap<String, String>>,
    #[serde(rename = "DatasetType")]
    pub dataset_type: Option<String>,
    #[serde(rename = "License")]
    pub license: Option<String>,
    #[serde(rename = "Authors")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "Acknowledgements")]
    pub acknowledgements: Option<String>,
    #[serde(rename = "HowToAcknowledge")]
    pub how_to_acknowledge: Option<String>,
    #[serde(rename = "Funding")]
    pub funding: Option<Vec<String>>,
    #[serde(rename = "EthicsApprovals")]
    pub ethics_approvals: Option<Vec<String>>,
    #[serde(rename = "ReferencesAndLinks")]
    pub references_and_links: Option<Vec<String>>,
    #[serde(rename = "DatasetDOI")]
    pub dataset_doi: Option<String>,
    #[serde(rename = "GeneratedBy")]
    pub generated_by: Option<Vec<GeneratedBy>>,
    #[serde(rename = "SourceDatasets")]
    pub source_datasets: Option<Vec<SourceDataset>>,
    #[serde(rename = "PipelineDescription")]
    pub pipeline_description: Option<GeneratedBy>,
}

impl DatasetDescription {
    /// Pipeline names declared by `GeneratedBy` and the legacy
    /// `PipelineDescription` field.
    pub fn pipeline_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .generated_by
            .iter()
            .flatten()
            .map(|gb| gb.name.as_str())
            .collect();
        if let Some(pd) = &self.pipeline_description {
            names.push(pd.name.as_str());
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Raw,
    Derivative,
}

/// Outcome of looking for the dataset's description file.
#[derive(Debug, Clone)]
pub enum DescriptionState {
    Missing,
    Parsed(DatasetDescription),
    Invalid(String),
}

/// One indexed dataset: canonical root, classification, optional derivative
/// label, description and the pipeline names it declares.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub root: String,
    pub kind: DatasetKind,
    pub label: Option<String>,
    pub description: DescriptionState,
    pub pipelines: Vec<String>,
}

impl Dataset {
    /// Build a dataset record for a canonicalized root, reading its
    /// description if present. A malformed description is remembered but
    /// does not fail the dataset.
    pub fn from_root(root: String, kind: DatasetKind, label: Option<String>) -> Self {
        let description_path = Path::new(&root).join("dataset_description.json");
        let description = if description_path.is_file() {
            match fs::read_to_string(&description_path) {
                Ok(contents) => match serde_json::from_str::<DatasetDescription>(&contents) {
                    Ok(description) => DescriptionState::Parsed(description),
                    Err(err) => {
                        warn!(root = %root, error = %err, "malformed dataset description");
                        DescriptionState::Invalid(err.to_string())
                    }
                },
                Err(err) => {
                    warn!(root = %root, error = %err, "unreadable dataset description");
                    DescriptionState::Invalid(err.to_string())
                }
            }
        } else {
            DescriptionState::Missing
        };
        let pipelines = match &description {
            DescriptionState::Parsed(description) => description
                .pipeline_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Self {
            root,
            kind,
            label,
            description,
            pipelines,
        }
    }

    /// The parsed description, `None` when absent, `BadDescription` when the
    /// file existed but could not be parsed.
    pub fn description(&self) -> Result<Option<&DatasetDescription>> {
        match &self.description {
            DescriptionState::Missing => Ok(None),
            DescriptionState::Parsed(description) => Ok(Some(description)),
            DescriptionState::Invalid(cause) => Err(LayoutError::BadDescription {
                root: PathBuf::from(&self.root),
                cause: cause.clone(),
            }),
        }
    }
}

/// Normalized form of the polymorphic `derivatives` argument.
#[derive(Debug, Clone, Default)]
pub enum DerivativesSpec {
    /// No derivative datasets.
    #[default]
    None,
    /// Auto-discover `derivatives/*/` under each raw root.
    Auto,
    /// Explicit derivative roots, unlabelled.
    Paths(Vec<PathBuf>),
    /// Explicit derivative roots keyed by label.
    Labeled(Vec<(String, PathBuf)>),
}

/// Scan `root/derivatives/*/` for directories carrying a
/// `dataset_description.json`, labelling each by its basename. Results are
/// name-sorted for deterministic dataset ordering.
pub fn discover_derivatives(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let derivatives = root.join("derivatives");
    if !derivatives.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    let entries =
        fs::read_dir(&derivatives).map_err(|err| LayoutError::io(&derivatives, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| LayoutError::io(&derivatives, err))?;
        let path = entry.path();
        if path.is_dir() && path.join("dataset_description.json").is_file() {
            let label = entry.file_name().to_string_lossy().to_string();
            found.push((label, path));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}
