//! layerd graph store.
//!
//! A local, on-disk repository of immutable filesystem layers plus the
//! metadata linking them into parent/child graphs. Layer bytes live in a
//! pluggable copy-on-write driver; the graph directory holds metadata and,
//! for bundles, a canonical archived copy. Two image formats share one
//! namespace and one truncated-id index: layered images with random ids and
//! self-describing bundles whose id is the SHA-256 of their decompressed
//! tar.

pub mod archive;
pub mod bundle;
pub mod driver;
pub mod graph;
pub mod id;
pub mod image;
pub mod initlayer;
pub mod truncindex;

#[cfg(test)]
pub(crate) mod testutil;

pub use archive::{ProgressReader, TempArchive};
pub use bundle::{BundleDependency, BundleLabel, BundleManifest};
pub use driver::Driver;
pub use graph::{CreateOptions, Graph, ProgressFn};
pub use id::{generate_id, truncate_id, validate_id};
pub use image::{Image, RunConfig};
pub use initlayer::setup_init_layer;
pub use truncindex::TruncIndex;

/// layerd graph store version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
