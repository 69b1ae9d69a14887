//! The image graph store.
//!
//! Owns the store root directory, the truncated-id index, and the
//! copy-on-write driver. Every non-atomic write happens in a scratch
//! directory under `_tmp` and is committed by a single rename; readers see
//! either the old state or the new, never a half-built directory.

use std::collections::{HashMap, HashSet};
use std::fs::{self, DirBuilder};
use std::io::{self, Read};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use layerd_core::config::{StoreConfig, SCRATCH_DIR};
use layerd_core::error::{GraphError, Result};

use crate::archive::{ProgressReader, TempArchive};
use crate::bundle::{self, BundleManifest};
use crate::driver::Driver;
use crate::id;
use crate::image::Image;
use crate::truncindex::TruncIndex;

/// Progress callback invoked with the cumulative byte count of a transfer.
pub type ProgressFn = Box<dyn FnMut(u64) + Send>;

/// Optional provenance and configuration for [`Graph::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Id of the container the layer is committed from.
    pub container: Option<String>,
    /// Image the committing container was created from; becomes the parent.
    pub container_image: Option<String>,
    pub comment: Option<String>,
    pub author: Option<String>,
    pub container_config: Option<crate::image::RunConfig>,
    pub config: Option<crate::image::RunConfig>,
}

/// A store for versioned filesystem images and the relationships between
/// them.
pub struct Graph {
    root: PathBuf,
    index: Mutex<TruncIndex>,
    in_flight: Mutex<HashSet<String>>,
    driver: Box<dyn Driver>,
}

impl Graph {
    /// Open (creating if necessary) a graph store rooted at `root`.
    ///
    /// The index is rebuilt by scanning the root: every id-named child the
    /// driver also knows becomes an index entry. Children the driver does
    /// not know are orphaned metadata and are left in place.
    pub fn new(root: impl AsRef<Path>, driver: Box<dyn Driver>) -> Result<Self> {
        match DirBuilder::new().recursive(true).mode(0o700).create(root.as_ref()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        let root = fs::canonicalize(root.as_ref())?;

        let graph = Self {
            root,
            index: Mutex::new(TruncIndex::new()),
            in_flight: Mutex::new(HashSet::new()),
            driver,
        };
        graph.restore()?;
        Ok(graph)
    }

    /// Open a graph store from a [`StoreConfig`].
    pub fn with_config(config: &StoreConfig, driver: Box<dyn Driver>) -> Result<Self> {
        Self::new(&config.root, driver)
    }

    fn restore(&self) -> Result<()> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name == SCRATCH_DIR {
                continue;
            }
            if self.driver.exists(&name) {
                ids.push(name);
            } else {
                tracing::debug!(id = %id::truncate_id(&name), "skipping orphaned graph entry");
            }
        }

        let count = ids.len();
        *self.index.lock().unwrap() = TruncIndex::from_ids(ids);
        tracing::debug!(count, driver = self.driver.name(), "restored image index");
        Ok(())
    }

    /// The directory a registered image lives in.
    pub fn image_root(&self, img_id: &str) -> PathBuf {
        self.root.join(img_id)
    }

    /// The driver backing this store.
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Create a fresh scratch directory under the store root.
    ///
    /// Callers either rename it into final position or recursively remove
    /// it; cleanup on error is the default discipline.
    pub fn mktemp(&self) -> Result<PathBuf> {
        let dir = self.root.join(SCRATCH_DIR).join(id::generate_id());
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        Ok(dir)
    }

    /// Whether an image is registered at the given id or prefix.
    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Return the image with the given id or unambiguous prefix.
    ///
    /// If the layer size has not been computed yet it is fetched from the
    /// driver and cached inside the image directory before returning.
    pub fn get(&self, name: &str) -> Result<Image> {
        let img_id = self.index.lock().unwrap().get(name)?;
        let dir = self.image_root(&img_id);

        let mut image = Image::load(&dir)?;
        if image.id != img_id {
            return Err(GraphError::WrongId {
                path: dir.display().to_string(),
                found: image.id,
            });
        }

        if image.size.is_none() {
            let size = self.driver.diff_size(&image.id, image.parent.as_deref())?;
            image.size = Some(size);
            image.save_size(&dir)?;
        }
        Ok(image)
    }

    /// Create a new image from a layer stream and register it.
    pub fn create<R: Read>(&self, layer: R, options: CreateOptions) -> Result<Image> {
        let mut image = Image {
            id: id::generate_id(),
            parent: None,
            created: Utc::now(),
            comment: options.comment,
            author: options.author,
            container: None,
            container_config: None,
            architecture: Some(std::env::consts::ARCH.to_string()),
            os: Some(std::env::consts::OS.to_string()),
            config: options.config,
            size: None,
        };
        if let Some(container) = options.container {
            image.parent = options.container_image;
            image.container = Some(container);
            image.container_config = options.container_config;
        }
        self.register(&mut image, layer)?;
        Ok(image)
    }

    /// Import a pre-existing image into the graph.
    ///
    /// The driver layer is created and the diff applied first; the metadata
    /// directory is committed last by rename. Any failure removes the
    /// driver layer and the scratch directory, leaving the store untouched.
    /// On success `image.size` is set to the applied byte count.
    pub fn register<R: Read>(&self, image: &mut Image, layer: R) -> Result<()> {
        id::validate_id(&image.id)?;
        let _guard = self.lock_id(&image.id)?;

        if self.index.lock().unwrap().contains(&image.id) {
            return Err(GraphError::AlreadyExists(image.id.clone()));
        }

        // Stale metadata can survive a driver switch; clear it so the
        // rename commit below cannot collide.
        let dir = self.image_root(&image.id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // The graph is the source of truth: a driver layer without a graph
        // entry is stale state from an interrupted registration.
        self.best_effort_driver_remove(&image.id);

        let tmp = self.mktemp()?;
        match self.register_inner(image, layer, &tmp) {
            Ok(()) => {
                self.index.lock().unwrap().add(&image.id)?;
                tracing::debug!(id = %id::truncate_id(&image.id), "registered image");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&tmp);
                self.best_effort_driver_remove(&image.id);
                Err(err)
            }
        }
    }

    fn register_inner<R: Read>(&self, image: &mut Image, mut layer: R, tmp: &Path) -> Result<()> {
        self.driver.create(&image.id, image.parent.as_deref())?;
        let size = self
            .driver
            .apply_diff(&image.id, image.parent.as_deref(), &mut layer)?;

        image.size = Some(size);
        image.save(tmp)?;
        fs::rename(tmp, self.image_root(&image.id))?;
        Ok(())
    }

    /// Ingest a self-describing bundle stream.
    ///
    /// The id is the SHA-256 of the decompressed tar bytes, so ingesting
    /// the same bundle twice is a no-op returning the stored identity.
    /// Dependencies named in the manifest are resolved against currently
    /// stored bundles; the resolved ids are recorded in the bundle
    /// directory and the first becomes the driver-side parent.
    pub fn register_bundle<R: Read>(&self, reader: R) -> Result<(BundleManifest, String)> {
        let tmp = self.mktemp()?;
        let result = self.register_bundle_inner(&tmp, reader);
        // After a successful commit the scratch dir has been renamed away
        // and this is a no-op.
        let _ = fs::remove_dir_all(&tmp);
        result
    }

    fn register_bundle_inner<R: Read>(
        &self,
        tmp: &Path,
        reader: R,
    ) -> Result<(BundleManifest, String)> {
        let (manifest, bundle_id) = bundle::unpack_bundle(tmp, reader)?;

        let _guard = self.lock_id(&bundle_id)?;

        // Identity is intrinsic: an existing directory already holds
        // exactly this bundle.
        if self.image_root(&bundle_id).exists() {
            return Ok((manifest, bundle_id));
        }

        let parents: Vec<String> = manifest
            .dependencies
            .iter()
            .filter_map(|dep| self.resolve_bundle_name(&dep.name))
            .collect();

        let mut layer = bundle::create_layer_tar(tmp)?;
        fs::remove_dir_all(tmp.join(bundle::ROOTFS_DIR))?;
        bundle::save_parents(tmp, &parents)?;

        let parent = parents.first().map(String::as_str);
        self.driver.create(&bundle_id, parent)?;

        let commit = (|| -> Result<()> {
            self.driver.apply_diff(&bundle_id, parent, &mut layer)?;
            drop(layer);
            fs::rename(tmp, self.image_root(&bundle_id))?;
            Ok(())
        })();
        if let Err(err) = commit {
            self.best_effort_driver_remove(&bundle_id);
            return Err(err);
        }

        self.index.lock().unwrap().add(&bundle_id)?;
        tracing::debug!(id = %id::truncate_id(&bundle_id), name = %manifest.name, "registered bundle");
        Ok((manifest, bundle_id))
    }

    /// Return the id and manifest of the bundle with the given id or
    /// prefix.
    pub fn get_bundle(&self, name: &str) -> Result<(String, BundleManifest)> {
        let bundle_id = self.index.lock().unwrap().get(name)?;
        let manifest = bundle::load_manifest(&self.image_root(&bundle_id))?;
        Ok((bundle_id, manifest))
    }

    /// Find the stored bundle carrying the given manifest name.
    fn resolve_bundle_name(&self, name: &str) -> Option<String> {
        let mut found = None;
        let walked = self.walk_bundles(|bundle_id, manifest| {
            if found.is_none() && manifest.name == name {
                found = Some(bundle_id.to_string());
            }
        });
        if walked.is_err() {
            return None;
        }
        found
    }

    /// Atomically remove an image from the graph.
    ///
    /// The id leaves the index before any filesystem work, and the image
    /// directory is renamed into scratch before removal, so concurrent
    /// lookups either resolve the old state completely or not at all.
    pub fn delete(&self, name: &str) -> Result<()> {
        let img_id = self.index.lock().unwrap().get(name)?;

        let tmp = self.mktemp();
        if let Err(err) = self.index.lock().unwrap().delete(&img_id) {
            if let Ok(tmp) = &tmp {
                let _ = fs::remove_dir_all(tmp);
            }
            return Err(err);
        }

        let doomed = match tmp {
            Ok(tmp) => match fs::rename(self.image_root(&img_id), &tmp) {
                Ok(()) => tmp,
                Err(_) => {
                    let _ = fs::remove_dir_all(&tmp);
                    self.image_root(&img_id)
                }
            },
            Err(_) => self.image_root(&img_id),
        };

        self.best_effort_driver_remove(&img_id);
        fs::remove_dir_all(&doomed)?;
        tracing::debug!(id = %id::truncate_id(&img_id), "deleted image");
        Ok(())
    }

    fn best_effort_driver_remove(&self, img_id: &str) {
        match self.driver.remove(img_id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                tracing::warn!(id = %id::truncate_id(img_id), %err, "driver remove failed");
            }
        }
    }

    fn walk_all<F: FnMut(Image)>(&self, mut handler: F) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            // Entries that fail to load do not block the walk.
            match self.get(&name) {
                Ok(image) => handler(image),
                Err(_) => continue,
            }
        }
        Ok(())
    }

    fn walk_bundles<F: FnMut(&str, &BundleManifest)>(&self, mut handler: F) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            match self.get_bundle(&name) {
                Ok((bundle_id, manifest)) => handler(&bundle_id, &manifest),
                Err(_) => continue,
            }
        }
        Ok(())
    }

    /// All layered images in the graph, keyed by id.
    pub fn map(&self) -> Result<HashMap<String, Image>> {
        let mut images = HashMap::new();
        self.walk_all(|image| {
            images.insert(image.id.clone(), image);
        })?;
        Ok(images)
    }

    /// All bundles in the graph, keyed by id.
    pub fn map_bundles(&self) -> Result<HashMap<String, BundleManifest>> {
        let mut bundles = HashMap::new();
        self.walk_bundles(|bundle_id, manifest| {
            bundles.insert(bundle_id.to_string(), manifest.clone());
        })?;
        Ok(bundles)
    }

    /// Lookup table of layered images by parent id. Images with a missing
    /// or unresolvable parent are omitted.
    pub fn by_parent(&self) -> Result<HashMap<String, Vec<Image>>> {
        let mut by_parent: HashMap<String, Vec<Image>> = HashMap::new();
        self.walk_all(|image| {
            let parent_id = match &image.parent {
                Some(parent) => match self.get(parent) {
                    Ok(parent) => parent.id,
                    Err(_) => return,
                },
                None => return,
            };
            by_parent.entry(parent_id).or_default().push(image);
        })?;
        Ok(by_parent)
    }

    /// Lookup table of bundles by parent id, using the parent ids recorded
    /// at ingest time.
    pub fn by_parent_bundles(&self) -> Result<HashMap<String, Vec<BundleManifest>>> {
        let mut by_parent: HashMap<String, Vec<BundleManifest>> = HashMap::new();
        self.walk_bundles(|bundle_id, manifest| {
            let parents = match bundle::load_parents(&self.image_root(bundle_id)) {
                Ok(parents) => parents,
                Err(_) => return,
            };
            for parent_id in parents {
                if self.index.lock().unwrap().contains(&parent_id) {
                    by_parent
                        .entry(parent_id)
                        .or_default()
                        .push(manifest.clone());
                }
            }
        })?;
        Ok(by_parent)
    }

    /// All layered heads: images that are not the parent of any other
    /// image, keyed by id.
    pub fn heads(&self) -> Result<HashMap<String, Image>> {
        let by_parent = self.by_parent()?;
        let mut heads = HashMap::new();
        self.walk_all(|image| {
            if !by_parent.contains_key(&image.id) {
                heads.insert(image.id.clone(), image);
            }
        })?;
        Ok(heads)
    }

    /// All bundle heads, keyed by id.
    pub fn heads_bundles(&self) -> Result<HashMap<String, BundleManifest>> {
        let by_parent = self.by_parent_bundles()?;
        let mut heads = HashMap::new();
        self.walk_bundles(|bundle_id, manifest| {
            if !by_parent.contains_key(bundle_id) {
                heads.insert(bundle_id.to_string(), manifest.clone());
            }
        })?;
        Ok(heads)
    }

    /// Buffer an image's layer to a self-deleting scratch file.
    ///
    /// The caller gets seek semantics over the archive and the driver's
    /// stream is released as soon as the buffering copy finishes. If a
    /// progress callback is given it receives the cumulative byte count as
    /// the layer is buffered.
    pub fn temp_layer_archive(
        &self,
        name: &str,
        progress: Option<ProgressFn>,
    ) -> Result<TempArchive> {
        let image = self.get(name)?;
        let tmp = self.mktemp()?;
        let stream = self.driver.tar_layer(&image.id)?;

        let path = tmp.join(bundle::LAYER_FILE);
        let archive = match progress {
            Some(callback) => TempArchive::new(ProgressReader::new(stream, callback), path)?,
            None => TempArchive::new(stream, path)?,
        };
        tracing::debug!(
            id = %id::truncate_id(&image.id),
            size = archive.size(),
            "buffered layer archive to disk"
        );
        Ok(archive)
    }

    /// Mark an id as having an operation in flight, failing if one already
    /// is. The guard covers the whole registration including cleanup, so a
    /// concurrent retry cannot race a half-finished rollback.
    fn lock_id(&self, img_id: &str) -> Result<IdGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if !in_flight.insert(img_id.to_string()) {
            return Err(GraphError::AlreadyExists(img_id.to_string()));
        }
        Ok(IdGuard {
            set: &self.in_flight,
            img_id: img_id.to_string(),
        })
    }
}

struct IdGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    img_id: String,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.img_id);
    }
}
