//! Copy-on-write driver contract.
//!
//! A driver owns the raw rootfs bytes of every layer; the graph directory
//! holds only metadata. Drivers are not required to be transactional: the
//! graph controls commit order (driver first, metadata rename last) and
//! removes driver state when the metadata write fails.

use std::io::Read;

use layerd_core::error::Result;

/// Abstract backend that materializes layer chains as mountable rootfs trees.
///
/// Concurrent calls on distinct ids must be safe; behavior for concurrent
/// calls on the same id is undefined, and the graph prevents that case
/// through its id-uniqueness checks.
pub trait Driver: Send + Sync {
    /// Short driver name, used in log and error messages.
    fn name(&self) -> &str;

    /// Whether a layer exists for the given id.
    fn exists(&self, id: &str) -> bool;

    /// Create a new layer on top of `parent`, ready for writes.
    /// A `None` parent creates a base layer.
    fn create(&self, id: &str, parent: Option<&str>) -> Result<()>;

    /// Apply a tar diff stream to the layer and return the number of bytes
    /// of changes applied.
    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64>;

    /// Size in bytes of the changes the layer holds over its parent.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64>;

    /// Remove the layer's storage. Removing an unknown id must yield an
    /// error for which [`GraphError::is_not_found`] is true, never a
    /// generic failure.
    ///
    /// [`GraphError::is_not_found`]: layerd_core::error::GraphError::is_not_found
    fn remove(&self, id: &str) -> Result<()>;

    /// Canonical uncompressed tar stream of the layer's changes over its
    /// parent.
    fn tar_layer(&self, id: &str) -> Result<Box<dyn Read + Send>>;
}
