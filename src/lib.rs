//! # BlitzPack Core Library
//!
//! Assembles named resources (files, directory trees, entries of other archives, in-memory
//! content) into zip or tar containers, and unpacks such containers safely.
//!
//! ## Key Modules
//!
//! - [`archive`]: the [`Archiver`] front door, resource iteration and duplicate resolution.
//! - [`workers`]: parallel per-entry compression with an order-preserving drain.
//! - [`extract`]: the [`Extractor`], with path-escape, overwrite and output-size protection.
//! - [`attributes`]: permission/owner precedence and reproducible-build normalization.
//! - [`resource`]: resource handles and the collections that enumerate them.
//! - [`format`]: zip and tar adapters behind the sink/source seams.
//!
//! ## Examples
//!
//! ```no_run
//! use blitzpack::{Archiver, CollectionOptions, Extractor};
//!
//! # fn main() -> Result<(), blitzpack::ArchiverError> {
//! let mut archiver = Archiver::with_destination("target/app.jar");
//! archiver.add_directory("build/classes", CollectionOptions::default())?;
//! archiver.add_bytes("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec(), None)?;
//! archiver.build()?;
//!
//! Extractor::default().extract("target/app.jar", "target/unpacked", None)?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod attributes;
pub mod common;
pub mod compress;
pub mod error;
pub mod extract;
pub mod format;
pub mod mapper;
pub mod resource;
pub mod workers;

// Cross-platform filesystem wrapper
pub mod fsx;

pub use archive::{Archiver, ArchiverConfig, BuildOutcome, DuplicatePolicy};
pub use attributes::{PermissionConfig, ReproducibilityConfig};
pub use error::ArchiverError;
pub use extract::{ExtractOptions, ExtractStats, Extractor};
pub use format::ArchiveFormat;
pub use resource::{CollectionOptions, ResourceCollection, ResourceHandle};
