//! Test support: an in-memory mock driver and bundle fixtures.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use layerd_core::error::{GraphError, Result};

use crate::driver::Driver;

#[derive(Debug, Clone)]
pub struct MockLayer {
    pub parent: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    layers: HashMap<String, MockLayer>,
    calls: Vec<String>,
}

/// In-memory driver recording every call it receives. Clones share state,
/// so tests can hand one clone to the graph and inspect the other.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn layer(&self, id: &str) -> Option<MockLayer> {
        self.state.lock().unwrap().layers.get(id).cloned()
    }

    /// Plant a layer directly, simulating state left behind by a crash.
    pub fn plant_layer(&self, id: &str, parent: Option<&str>, bytes: &[u8]) {
        self.state.lock().unwrap().layers.insert(
            id.to_string(),
            MockLayer {
                parent: parent.map(str::to_string),
                bytes: bytes.to_vec(),
            },
        );
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn exists(&self, id: &str) -> bool {
        self.state.lock().unwrap().layers.contains_key(id)
    }

    fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("create:{}:{}", id, parent.unwrap_or("")));
        if state.layers.contains_key(id) {
            return Err(GraphError::Driver(format!("layer {} already exists", id)));
        }
        state.layers.insert(
            id.to_string(),
            MockLayer {
                parent: parent.map(str::to_string),
                bytes: Vec::new(),
            },
        );
        Ok(())
    }

    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
        let mut bytes = Vec::new();
        diff.read_to_end(&mut bytes)?;

        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("apply_diff:{}:{}", id, parent.unwrap_or("")));
        let layer = state
            .layers
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        let size = bytes.len() as u64;
        layer.bytes = bytes;
        Ok(size)
    }

    fn diff_size(&self, id: &str, _parent: Option<&str>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("diff_size:{}", id));
        state
            .layers
            .get(id)
            .map(|layer| layer.bytes.len() as u64)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{}", id));
        match state.layers.remove(id) {
            Some(_) => Ok(()),
            None => Err(GraphError::NotFound(id.to_string())),
        }
    }

    fn tar_layer(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let state = self.state.lock().unwrap();
        let layer = state
            .layers
            .get(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        Ok(Box::new(Cursor::new(layer.bytes.clone())))
    }
}

/// A reader that fails after yielding a few bytes, simulating an aborted
/// ingress stream.
pub struct FailingReader {
    remaining: usize,
}

impl FailingReader {
    pub fn new(yield_bytes: usize) -> Self {
        Self {
            remaining: yield_bytes,
        }
    }
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream aborted",
            ));
        }
        let n = self.remaining.min(buf.len());
        buf[..n].fill(b'x');
        self.remaining -= n;
        Ok(n)
    }
}

/// Build an uncompressed tar with the given regular-file entries.
pub fn build_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

/// Build a bundle tar: a manifest with the given name and dependencies,
/// plus rootfs file entries.
pub fn build_bundle_tar(name: &str, dependencies: &[&str], files: &[(&str, &str)]) -> Vec<u8> {
    let deps: Vec<String> = dependencies
        .iter()
        .map(|dep| format!(r#"{{"name":"{}"}}"#, dep))
        .collect();
    let manifest = format!(
        r#"{{"name":"{}","dependencies":[{}]}}"#,
        name,
        deps.join(",")
    );

    let mut entries: Vec<(&str, &str)> = vec![("manifest", manifest.as_str())];
    entries.extend_from_slice(files);
    build_tar(&entries)
}

/// Gzip-compress a byte slice.
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}
