//! Mount seam between computers and whatever storage backs them.
//!
//! Real storage layers live outside this workspace; [`MemoryMount`] is
//! enough for hosts that keep everything in memory and for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::CoreError;

/// A read-only tree of files.
pub trait Mount: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    fn read(&self, path: &str) -> Result<Vec<u8>, CoreError>;
}

/// A mount which may also be written to.
pub trait WritableMount: Mount {
    fn write(&self, path: &str, contents: &[u8]) -> Result<(), CoreError>;

    /// Bytes which may still be written.
    fn remaining_space(&self) -> u64;
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// In-memory mount with a fixed capacity.
#[derive(Debug)]
pub struct MemoryMount {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    capacity: u64,
}

impl MemoryMount {
    pub fn new(capacity: u64) -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Builder-style helper for seeding read-only content such as a ROM.
    pub fn with_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path), contents.into());
        self
    }

    fn used(&self, files: &BTreeMap<String, Vec<u8>>) -> u64 {
        files.values().map(|f| f.len() as u64).sum()
    }
}

impl Mount for MemoryMount {
    fn exists(&self, path: &str) -> bool {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.contains_key(&normalize(path))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, CoreError> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| CoreError::FileNotFound(path.to_string()))
    }
}

impl WritableMount for MemoryMount {
    fn write(&self, path: &str, contents: &[u8]) -> Result<(), CoreError> {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let key = normalize(path);
        let existing = files.get(&key).map(|f| f.len() as u64).unwrap_or(0);
        let used = self.used(&files) - existing;
        if used + contents.len() as u64 > self.capacity {
            return Err(CoreError::Mount(format!("{}: out of space", path)));
        }
        files.insert(key, contents.to_vec());
        Ok(())
    }

    fn remaining_space(&self) -> u64 {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        self.capacity.saturating_sub(self.used(&files))
    }
}

enum Attached {
    ReadOnly(Arc<dyn Mount>),
    Writable(Arc<dyn WritableMount>),
}

struct MountPoint {
    label: String,
    location: String,
    mount: Attached,
}

/// A computer's view of its storage: a writable root with read-only mounts
/// (such as the ROM) attached at fixed locations.
///
/// Closing consumes the filesystem, so a computer can never unmount twice.
pub struct FileSystem {
    mounts: Vec<MountPoint>,
}

impl FileSystem {
    pub fn new(label: &str, root: Arc<dyn WritableMount>) -> Self {
        Self {
            mounts: vec![MountPoint {
                label: label.to_string(),
                location: String::new(),
                mount: Attached::Writable(root),
            }],
        }
    }

    /// Attach a read-only mount at `location`.
    pub fn mount(&mut self, label: &str, location: &str, mount: Arc<dyn Mount>) -> Result<(), CoreError> {
        let location = normalize(location);
        if location.is_empty() || self.mounts.iter().any(|m| m.location == location) {
            return Err(CoreError::Mount(format!("/{} is already mounted", location)));
        }
        self.mounts.push(MountPoint {
            label: label.to_string(),
            location,
            mount: Attached::ReadOnly(mount),
        });
        Ok(())
    }

    /// Find the most specific mount containing `path`, and the path relative to it.
    fn resolve(&self, path: &str) -> (&MountPoint, String) {
        let path = normalize(path);
        let mut best = &self.mounts[0];
        for point in &self.mounts[1..] {
            let inside = path == point.location || path.starts_with(&format!("{}/", point.location));
            if inside && point.location.len() > best.location.len() {
                best = point;
            }
        }
        let relative = path
            .strip_prefix(best.location.as_str())
            .unwrap_or(&path)
            .trim_start_matches('/')
            .to_string();
        (best, relative)
    }

    pub fn exists(&self, path: &str) -> bool {
        let (point, relative) = self.resolve(path);
        match &point.mount {
            Attached::ReadOnly(m) => m.exists(&relative),
            Attached::Writable(m) => m.exists(&relative),
        }
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, CoreError> {
        let (point, relative) = self.resolve(path);
        match &point.mount {
            Attached::ReadOnly(m) => m.read(&relative),
            Attached::Writable(m) => m.read(&relative),
        }
    }

    pub fn write(&self, path: &str, contents: &[u8]) -> Result<(), CoreError> {
        let (point, relative) = self.resolve(path);
        match &point.mount {
            Attached::ReadOnly(_) => Err(CoreError::Mount(format!("/{}: access denied", normalize(path)))),
            Attached::Writable(m) => m.write(&relative, contents),
        }
    }

    /// Labels of every attached mount, root first.
    pub fn labels(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.label.as_str()).collect()
    }

    /// Detach every mount.
    pub fn close(self) -> usize {
        let count = self.mounts.len();
        tracing::debug!(mounts = count, "filesystem closed");
        count
    }
}
