//! Layered image metadata.
//!
//! A layered image is identified by a random 64-hex id and described by a
//! JSON metadata document stored inside its id directory. The layer bytes
//! themselves live in the driver; the directory holds only metadata.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use layerd_core::error::{GraphError, Result};
use serde::{Deserialize, Serialize};

/// Metadata document file name inside an image directory.
pub const METADATA_FILE: &str = "image.json";

/// Cached layer size file name inside an image directory.
pub const SIZE_FILE: &str = "layersize";

/// Launch configuration captured with an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    /// Environment variables as KEY=VALUE strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// A layered image: one filesystem diff over an optional parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Full 64-hex image id. Must equal the directory name it is stored in.
    pub id: String,

    /// Id of the immediate parent image, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    pub created: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Id of the container this layer was committed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Configuration of the container that produced this layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<RunConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    /// Launch configuration captured with the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,

    /// Bytes this layer adds over its parent. Cached in [`SIZE_FILE`], not
    /// in the metadata document; `None` means not computed yet.
    #[serde(skip)]
    pub size: Option<u64>,
}

impl Image {
    /// Load an image's metadata from its id directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(dir.join(METADATA_FILE))?;
        let mut image: Image = serde_json::from_str(&raw)?;

        match fs::read_to_string(dir.join(SIZE_FILE)) {
            Ok(raw) => {
                image.size = Some(raw.trim().parse().map_err(|_| {
                    GraphError::Malformed(format!(
                        "unreadable layer size for image {}: '{}'",
                        image.id,
                        raw.trim()
                    ))
                })?);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(image)
    }

    /// Write the metadata document (and the size cache, if computed) into
    /// `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        fs::write(dir.join(METADATA_FILE), raw)?;
        if self.size.is_some() {
            self.save_size(dir)?;
        }
        Ok(())
    }

    /// Persist the computed layer size into `dir`.
    ///
    /// This is the only in-place mutation an image directory sees after
    /// commit; it is a single-file write and idempotent.
    pub fn save_size(&self, dir: &Path) -> Result<()> {
        let size = self.size.ok_or_else(|| {
            GraphError::Malformed(format!("image {} has no size to save", self.id))
        })?;
        fs::write(dir.join(SIZE_FILE), size.to_string())?;
        Ok(())
    }
}
