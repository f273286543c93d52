//! Map lookup and transfer.
//!
//! The server announces a map by name, SHA-256 and size. The client looks it
//! up in local storage and, if missing, downloads it chunk by chunk. A
//! finished download is verified against the announced size and hash before
//! it is stored.

use std::fs;
use std::path::{Path, PathBuf};

use engine_shared::{
    error::{ClientError, ClientResult},
    net::MapDescriptor,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Upper bound for the buffer reserved when a download starts; the rest
/// grows with the received chunks.
const MAX_PREALLOC: usize = 1024 * 1024;

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Local map storage.
pub trait MapStorage {
    /// Path of a stored map matching name and hash.
    fn find(&self, map: &MapDescriptor) -> Option<PathBuf>;

    /// Stores a verified download and returns where it went.
    fn store(&mut self, map: &MapDescriptor, data: &[u8]) -> ClientResult<PathBuf>;
}

/// Maps on disk under one root directory.
///
/// Shipped maps live at `<root>/<name>.map`; downloads go to
/// `<root>/downloadedmaps/<name>_<sha256 prefix>.map`.
#[derive(Debug, Clone)]
pub struct DirMapStorage {
    root: PathBuf,
}

impl DirMapStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn download_path(&self, map: &MapDescriptor) -> PathBuf {
        let prefix: String = map.sha256.chars().take(8).collect();
        self.root
            .join("downloadedmaps")
            .join(format!("{}_{}.map", map.name, prefix))
    }

    fn matches(path: &Path, map: &MapDescriptor) -> bool {
        match fs::read(path) {
            Ok(data) => data.len() as u64 == map.size && sha256_hex(&data) == map.sha256,
            Err(_) => false,
        }
    }
}

impl MapStorage for DirMapStorage {
    fn find(&self, map: &MapDescriptor) -> Option<PathBuf> {
        [self.root.join(format!("{}.map", map.name)), self.download_path(map)]
            .into_iter()
            .find(|path| {
                let ok = Self::matches(path, map);
                debug!(path = %path.display(), found = ok, "Map lookup");
                ok
            })
    }

    fn store(&mut self, map: &MapDescriptor, data: &[u8]) -> ClientResult<PathBuf> {
        let path = self.download_path(map);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ClientError::resource(format!("create {}: {e}", parent.display()))
            })?;
        }
        fs::write(&path, data)
            .map_err(|e| ClientError::resource(format!("write {}: {e}", path.display())))?;
        info!(map = %map.name, path = %path.display(), "Stored downloaded map");
        Ok(path)
    }
}

/// Read-only download progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapProgress {
    pub name: String,
    pub amount: u64,
    pub total: u64,
}

/// What a received chunk did to the download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Request chunk `next`.
    More { next: u32 },
    /// All data received and verified.
    Complete,
}

/// An in-flight map download.
#[derive(Debug)]
pub struct MapDownload {
    map: MapDescriptor,
    data: Vec<u8>,
    next_chunk: u32,
}

impl MapDownload {
    pub fn new(map: MapDescriptor) -> Self {
        let reserve = usize::try_from(map.size).map_or(MAX_PREALLOC, |size| size.min(MAX_PREALLOC));
        Self {
            data: Vec::with_capacity(reserve),
            map,
            next_chunk: 0,
        }
    }

    pub fn map(&self) -> &MapDescriptor {
        &self.map
    }

    pub fn next_chunk(&self) -> u32 {
        self.next_chunk
    }

    pub fn progress(&self) -> MapProgress {
        MapProgress {
            name: self.map.name.clone(),
            amount: self.data.len() as u64,
            total: self.map.size,
        }
    }

    /// Appends chunk `chunk`. Out-of-order chunks and oversize data are
    /// protocol errors; a size or hash mismatch on the last chunk is a
    /// resource error.
    pub fn push_chunk(&mut self, chunk: u32, last: bool, data: &[u8]) -> ClientResult<ChunkOutcome> {
        if chunk != self.next_chunk {
            return Err(ClientError::protocol(format!(
                "map chunk {chunk} received, expected {}",
                self.next_chunk
            )));
        }
        if self.data.len() as u64 + data.len() as u64 > self.map.size {
            return Err(ClientError::protocol(format!(
                "map data exceeds announced size {}",
                self.map.size
            )));
        }
        self.data.extend_from_slice(data);
        self.next_chunk += 1;

        if !last {
            return Ok(ChunkOutcome::More {
                next: self.next_chunk,
            });
        }
        if self.data.len() as u64 != self.map.size {
            return Err(ClientError::resource(format!(
                "map {} truncated: {} of {} bytes",
                self.map.name,
                self.data.len(),
                self.map.size
            )));
        }
        let digest = sha256_hex(&self.data);
        if digest != self.map.sha256 {
            return Err(ClientError::resource(format!(
                "map {} checksum mismatch",
                self.map.name
            )));
        }
        Ok(ChunkOutcome::Complete)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_parts(self) -> (MapDescriptor, Vec<u8>) {
        (self.map, self.data)
    }
}
