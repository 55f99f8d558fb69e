//! Namespace and chunk directory: path to file, file to ordered chunk
//! handles, handle to replica set and lease holder. One lock covers both
//! maps; it is never held across an RPC.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tonic::Status;

use gfs_common::GfsError;

use crate::gfs::PathInfo;

#[derive(Debug)]
enum Node {
    Dir,
    File(FileEntry),
}

#[derive(Debug, Default)]
struct FileEntry {
    /// Ordered chunk handles; index i covers file bytes
    /// `[i * max_chunk_size, (i + 1) * max_chunk_size)`.
    handles: Vec<u64>,
}

#[derive(Debug)]
struct ChunkMeta {
    locations: Vec<String>,
    primary: Option<String>,
    lease_expire: Instant,
}

#[derive(Debug)]
struct Directory {
    namespace: HashMap<String, Node>,
    chunks: HashMap<u64, ChunkMeta>,
    next_handle: u64,
}

#[derive(Debug)]
pub struct ChunkDirectory {
    inner: Mutex<Directory>,
}

fn validate_path(path: &str) -> Result<(), Status> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(Status::invalid_argument(format!(
            "invalid path {:?}",
            path
        )));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn leaf_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn unix_ms_after(remaining: Duration) -> u64 {
    (SystemTime::now() + remaining)
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}

impl Default for ChunkDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDirectory {
    pub fn new() -> Self {
        let mut namespace = HashMap::new();
        namespace.insert("/".to_string(), Node::Dir);
        ChunkDirectory {
            inner: Mutex::new(Directory {
                namespace,
                chunks: HashMap::new(),
                next_handle: 0,
            }),
        }
    }

    fn check_parent(dir: &Directory, path: &str) -> Result<(), Status> {
        match dir.namespace.get(parent_of(path)) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(Status::invalid_argument(format!(
                "parent of {:?} is a file",
                path
            ))),
            None => Err(Status::not_found(format!(
                "parent directory of {:?} does not exist",
                path
            ))),
        }
    }

    pub fn create_file(&self, path: &str) -> Result<(), Status> {
        validate_path(path)?;
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        Self::check_parent(&dir, path)?;
        if dir.namespace.contains_key(path) {
            return Err(Status::already_exists(format!("{:?} already exists", path)));
        }
        dir.namespace
            .insert(path.to_string(), Node::File(FileEntry::default()));
        Ok(())
    }

    /// Remove a file and forget its chunk metadata. Replicas are not told;
    /// their on-disk chunks become garbage.
    pub fn delete_file(&self, path: &str) -> Result<(), Status> {
        validate_path(path)?;
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        match dir.namespace.get(path) {
            Some(Node::File(_)) => {}
            Some(Node::Dir) => {
                return Err(Status::invalid_argument(format!("{:?} is a directory", path)))
            }
            None => return Err(Status::not_found(format!("{:?} does not exist", path))),
        }
        if let Some(Node::File(entry)) = dir.namespace.remove(path) {
            for handle in entry.handles {
                dir.chunks.remove(&handle);
            }
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> Result<(), Status> {
        validate_path(path)?;
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        Self::check_parent(&dir, path)?;
        if dir.namespace.contains_key(path) {
            return Err(Status::already_exists(format!("{:?} already exists", path)));
        }
        dir.namespace.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    pub fn list(&self, path: &str) -> Result<Vec<PathInfo>, Status> {
        if path != "/" {
            validate_path(path)?;
        }
        let dir = self.inner.lock().expect("directory lock poisoned");
        match dir.namespace.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(Status::invalid_argument(format!("{:?} is a file", path)))
            }
            None => return Err(Status::not_found(format!("{:?} does not exist", path))),
        }

        let mut files: Vec<PathInfo> = dir
            .namespace
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == path)
            .map(|(p, node)| match node {
                Node::Dir => PathInfo {
                    name: leaf_of(p).to_string(),
                    is_dir: true,
                    chunk_count: 0,
                },
                Node::File(entry) => PathInfo {
                    name: leaf_of(p).to_string(),
                    is_dir: false,
                    chunk_count: entry.handles.len() as u64,
                },
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// `(is_dir, chunk_count)` for a path.
    pub fn file_info(&self, path: &str) -> Result<(bool, u64), Status> {
        validate_path(path)?;
        let dir = self.inner.lock().expect("directory lock poisoned");
        match dir.namespace.get(path) {
            Some(Node::Dir) => Ok((true, 0)),
            Some(Node::File(entry)) => Ok((false, entry.handles.len() as u64)),
            None => Err(Status::not_found(format!("{:?} does not exist", path))),
        }
    }

    /// The handle at `index`, `None` if `index == chunk_count` (the caller
    /// should allocate), or an error beyond that.
    pub fn handle_at(&self, path: &str, index: u64) -> Result<Option<u64>, Status> {
        validate_path(path)?;
        let dir = self.inner.lock().expect("directory lock poisoned");
        let entry = Self::file_entry(&dir, path)?;
        match index.cmp(&(entry.handles.len() as u64)) {
            std::cmp::Ordering::Less => Ok(Some(entry.handles[index as usize])),
            std::cmp::Ordering::Equal => Ok(None),
            std::cmp::Ordering::Greater => Err(Status::invalid_argument(format!(
                "chunk index {} beyond end of {:?} ({} chunks)",
                index,
                path,
                entry.handles.len()
            ))),
        }
    }

    fn file_entry<'a>(dir: &'a Directory, path: &str) -> Result<&'a FileEntry, Status> {
        match dir.namespace.get(path) {
            Some(Node::File(entry)) => Ok(entry),
            Some(Node::Dir) => Err(Status::invalid_argument(format!(
                "{:?} is a directory",
                path
            ))),
            None => Err(Status::not_found(format!("{:?} does not exist", path))),
        }
    }

    /// Extend `path` with a freshly allocated handle at `index`, placing it
    /// on `locations` and granting the initial lease to the first of them.
    /// If a concurrent caller got there first, the existing handle comes
    /// back with `created = false`.
    pub fn allocate_chunk(
        &self,
        path: &str,
        index: u64,
        locations: Vec<String>,
        lease_timeout: Duration,
    ) -> Result<(u64, bool), Status> {
        validate_path(path)?;
        let mut guard = self.inner.lock().expect("directory lock poisoned");
        let dir = &mut *guard;

        let entry = match dir.namespace.get_mut(path) {
            Some(Node::File(entry)) => entry,
            Some(Node::Dir) => {
                return Err(Status::invalid_argument(format!(
                    "{:?} is a directory",
                    path
                )))
            }
            None => return Err(Status::not_found(format!("{:?} does not exist", path))),
        };

        match index.cmp(&(entry.handles.len() as u64)) {
            std::cmp::Ordering::Less => Ok((entry.handles[index as usize], false)),
            std::cmp::Ordering::Greater => Err(Status::invalid_argument(format!(
                "chunk index {} beyond end of {:?} ({} chunks)",
                index,
                path,
                entry.handles.len()
            ))),
            std::cmp::Ordering::Equal => {
                let handle = dir.next_handle;
                dir.next_handle += 1;
                entry.handles.push(handle);

                let primary = locations.first().cloned();
                dir.chunks.insert(
                    handle,
                    ChunkMeta {
                        locations,
                        primary,
                        lease_expire: Instant::now() + lease_timeout,
                    },
                );
                Ok((handle, true))
            }
        }
    }

    pub fn replicas(&self, handle: u64) -> Result<Vec<String>, Status> {
        let dir = self.inner.lock().expect("directory lock poisoned");
        dir.chunks
            .get(&handle)
            .map(|meta| meta.locations.clone())
            .ok_or_else(|| GfsError::ChunkNotFound(handle).into())
    }

    /// Current primary and secondaries for a handle, granting a fresh lease
    /// to a live replica when none is in force. An unexpired lease is
    /// honored even if its holder has since been declared dead; primacy
    /// moves only at expiry.
    pub fn primary_and_secondaries(
        &self,
        handle: u64,
        live: &HashSet<String>,
        lease_timeout: Duration,
    ) -> Result<(String, Vec<String>, u64), Status> {
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        let meta = dir
            .chunks
            .get_mut(&handle)
            .ok_or(GfsError::ChunkNotFound(handle))?;
        if meta.locations.is_empty() {
            return Err(Status::unavailable(format!(
                "chunk {} has no replicas",
                handle
            )));
        }

        let now = Instant::now();
        let lease_valid = meta.primary.is_some() && meta.lease_expire > now;
        if !lease_valid {
            let candidate = meta
                .locations
                .iter()
                .find(|loc| live.contains(*loc))
                .cloned()
                .ok_or_else(|| {
                    Status::unavailable(format!("no live replica of chunk {}", handle))
                })?;
            meta.primary = Some(candidate);
            meta.lease_expire = now + lease_timeout;
        }

        let primary = meta.primary.clone().expect("lease holder just set");
        let secondaries = meta
            .locations
            .iter()
            .filter(|loc| **loc != primary)
            .cloned()
            .collect();
        let remaining = meta.lease_expire.saturating_duration_since(now);
        Ok((primary, secondaries, unix_ms_after(remaining)))
    }

    /// Push the lease expiry out for a handle, but only for its current
    /// primary.
    pub fn extend_lease(&self, handle: u64, addr: &str, lease_timeout: Duration) {
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        if let Some(meta) = dir.chunks.get_mut(&handle) {
            if meta.primary.as_deref() == Some(addr) {
                meta.lease_expire = Instant::now() + lease_timeout;
            }
        }
    }

    /// Forget `addr` as a holder of each of `handles`.
    pub fn remove_location(&self, handles: &[u64], addr: &str) {
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        for handle in handles {
            if let Some(meta) = dir.chunks.get_mut(handle) {
                meta.locations.retain(|loc| loc != addr);
            }
        }
    }

    /// Record `addr` as a holder of `handle` (re-replication completion).
    pub fn add_location(&self, handle: u64, addr: &str) {
        let mut dir = self.inner.lock().expect("directory lock poisoned");
        if let Some(meta) = dir.chunks.get_mut(&handle) {
            if !meta.locations.iter().any(|loc| loc == addr) {
                meta.locations.push(addr.to_string());
            }
        }
    }

    /// Handles whose replica count fell below `min`.
    pub fn under_replicated(&self, min: usize) -> Vec<u64> {
        let dir = self.inner.lock().expect("directory lock poisoned");
        dir.chunks
            .iter()
            .filter(|(_, meta)| meta.locations.len() < min)
            .map(|(handle, _)| *handle)
            .collect()
    }
}
