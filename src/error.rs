use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("Unknown scope '{0}'")]
    UnknownScope(String),
    #[error("Query did not resolve to a single path; still varying: {0:?}")]
    NotUnique(Vec<String>),
    #[error("Layout has {0} candidate roots")]
    AmbiguousRoot(usize),
    #[error("Layout has no root")]
    NoRoot,
    #[error("Entity '{entity}' is '{dir_value}' in the directory but '{file_value}' in the filename")]
    InconsistentEntity {
        entity: String,
        dir_value: String,
        file_value: String,
    },
    #[error("Invalid entity value in token '{0}'")]
    InvalidEntityValue(String),
    #[error("Duplicate root '{}'", .0.display())]
    DuplicateRoot(PathBuf),
    #[error("Could not parse dataset description under '{}': {cause}", .root.display())]
    BadDescription { root: PathBuf, cause: String },
    #[error("Cache cannot be loaded: {0}")]
    CacheIncompatible(String),
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{}' does not lie under any configured dataset root", .0.display())]
    NotInRoot(PathBuf),
    #[error("Walk interrupted by cancellation")]
    Interrupted,
    #[error(transparent)]
    Glob(#[from] globset::Error),
}

impl LayoutError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LayoutError>;
