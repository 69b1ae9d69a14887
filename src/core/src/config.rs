use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the reserved scratch directory under the store root.
pub const SCRATCH_DIR: &str = "_tmp";

/// Configuration for an on-disk image graph store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Root directory of the graph store. Immediate children are id-named
    /// image directories plus the reserved scratch directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Name of the copy-on-write driver backing the store.
    #[serde(default = "default_driver")]
    pub driver: String,
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/layerd/graph")
}

fn default_driver() -> String {
    "overlay".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            driver: default_driver(),
        }
    }
}
