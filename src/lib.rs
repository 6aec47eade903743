//! Broca – a high-throughput indexer and query engine for BIDS datasets.
//!
//! Broca walks one or more dataset roots laid out under the Brain Imaging
//! Data Structure convention, parses every file path into a normalized
//! entity record, and exposes a composable query surface over the result:
//! * A [`parse::ParsedPath`] captures the entities (`sub-01`, `task-rest`),
//!   datatype, suffix and extension recovered from a path, plus any
//!   segments that resisted interpretation.
//! * A [`construct::LayoutIndex`] owns the dataset table, the parsed files
//!   and the `entity -> value -> bitmap` tables behind query evaluation.
//! * A [`view::Layout`] is a cheap immutable view: the shared index plus a
//!   compact selection. Queries return new views over the same index, so
//!   they chain freely and can cross thread boundaries.
//!
//! ## Modules
//! * [`entity`] – the static BIDS entity dictionary (long/short bijection,
//!   canonical ordering, datatype labels).
//! * [`parse`] – the strict/permissive path parser.
//! * [`dataset`] – dataset records, descriptions and derivative discovery.
//! * [`walk`] – filesystem enumeration with worker fan-out and cooperative
//!   cancellation.
//! * [`construct`] – the owning in-memory index.
//! * [`query`] – selections, query terms and filter evaluation.
//! * [`view`] – the public layout/view API.
//! * [`metadata`] – JSON sidecar resolution along the inheritance
//!   principle.
//! * [`persist`] – the versioned binary cache codec.
//!
//! ## Quick Start
//! ```no_run
//! use broca::{entity_query, Layout};
//! let layout = Layout::open(&["/data/study"])?;
//! let bold = layout.get(&entity_query!("subject": "01", "suffix": "bold"))?;
//! for file in bold.iter() {
//!     println!("{}", file.path());
//! }
//! # Ok::<(), broca::LayoutError>(())
//! ```
//!
//! ## Caching
//! Construction accepts a cache path; a cache whose dataset table matches
//! the request is loaded instead of walking, and [`view::Layout::save`] /
//! [`view::Layout::load`] expose the codec directly. The format is
//! versioned and checksummed; anything unexpected fails
//! [`error::LayoutError::CacheIncompatible`] rather than producing a
//! half-restored layout.

pub mod construct;
pub mod dataset;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod parse;
pub mod persist;
pub mod query;
pub mod view;
pub mod walk;

pub use dataset::{Dataset, DatasetDescription, DatasetKind, DerivativesSpec};
pub use error::{LayoutError, Result};
pub use parse::{ParseMode, ParsedPath};
pub use query::{EntityQuery, QueryTerm};
pub use view::{FileView, Layout, LayoutOptions};
pub use walk::CancelToken;
