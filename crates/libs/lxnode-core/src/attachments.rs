//! Content-addressed attachment storage.
//!
//! Outgoing attachments live under `attachments/out/<hash>.bin` where the
//! stem is the full SHA-256 of the bytes; `.mime` and `.name` sidecars are
//! written only when non-empty. Incoming attachments are cached per peer
//! under `attachments/in/<remote-hex>/`.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const CONTENT_HASH_HEX_LEN: usize = 64;
const MAX_NAME_CHARS: usize = 180;

const ATTACHMENTS_DIR: &str = "attachments";
const OUT_DIR: &str = "out";
const IN_DIR: &str = "in";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentDirection {
    Outbound,
    Inbound,
}

#[derive(Clone, Debug)]
pub struct AttachmentDescriptor {
    /// Full SHA-256 of the bytes, lowercase hex.
    pub hash: String,
    pub mime: String,
    pub name: String,
    pub size: u64,
    pub mtime: u64,
    pub direction: AttachmentDirection,
}

#[derive(Clone, Debug)]
pub struct LoadedAttachment {
    pub descriptor: AttachmentDescriptor,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

pub fn content_hash_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn is_content_hash_hex(hash: &str) -> bool {
    hash.len() == CONTENT_HASH_HEX_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Reduce a caller-supplied filename to a safe basename: path separators and
/// other forbidden characters become underscores, length is capped.
pub fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|ch| if ch == '\0' || ch == '/' || ch == '\\' || ch == ':' || ch.is_control() {
            '_'
        } else {
            ch
        })
        .take(MAX_NAME_CHARS)
        .collect()
}

pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(dir: &Path) -> Self {
        Self { root: dir.join(ATTACHMENTS_DIR) }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join(OUT_DIR)
    }

    pub fn in_dir(&self, remote_hex: &str) -> PathBuf {
        self.root.join(IN_DIR).join(remote_hex)
    }

    /// Store outgoing bytes. Idempotent: an existing `.bin` is left as-is.
    pub fn store(&self, bytes: &[u8], mime: &str, name: &str) -> io::Result<AttachmentDescriptor> {
        let hash = content_hash_hex(bytes);
        let dir = self.out_dir();
        std::fs::create_dir_all(&dir)?;
        let bin = dir.join(format!("{hash}.bin"));
        if !bin.exists() {
            std::fs::write(&bin, bytes)?;
        }
        let name = sanitize_name(name);
        if !mime.is_empty() {
            std::fs::write(dir.join(format!("{hash}.mime")), mime)?;
        }
        if !name.is_empty() {
            std::fs::write(dir.join(format!("{hash}.name")), &name)?;
        }
        let (size, mtime) = stat(&bin)?;
        Ok(AttachmentDescriptor {
            hash,
            mime: mime.to_string(),
            name,
            size,
            mtime,
            direction: AttachmentDirection::Outbound,
        })
    }

    /// Load an outgoing attachment by hash. Sidecars are best-effort; the
    /// blob itself is required.
    pub fn load(&self, hash: &str) -> io::Result<LoadedAttachment> {
        if !is_content_hash_hex(hash) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "malformed content hash"));
        }
        let hash = hash.to_ascii_lowercase();
        let dir = self.out_dir();
        let path = dir.join(format!("{hash}.bin"));
        let bytes = std::fs::read(&path)?;
        let (size, mtime) = stat(&path)?;
        let mime = read_sidecar(&dir.join(format!("{hash}.mime")));
        let name = read_sidecar(&dir.join(format!("{hash}.name")));
        Ok(LoadedAttachment {
            descriptor: AttachmentDescriptor {
                hash,
                mime,
                name,
                size,
                mtime,
                direction: AttachmentDirection::Outbound,
            },
            path,
            bytes,
        })
    }

    /// Cache hit for a previously fetched attachment: a non-empty `.bin`.
    pub fn cached_incoming(&self, remote_hex: &str, hash: &str) -> Option<PathBuf> {
        let path = self.in_dir(remote_hex).join(format!("{hash}.bin"));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    pub fn cache_incoming(
        &self,
        remote_hex: &str,
        hash: &str,
        bytes: &[u8],
        mime: Option<&str>,
        name: Option<&str>,
    ) -> io::Result<PathBuf> {
        let dir = self.in_dir(remote_hex);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{hash}.bin"));
        std::fs::write(&path, bytes)?;
        if let Some(mime) = mime.filter(|m| !m.is_empty()) {
            let _ = std::fs::write(dir.join(format!("{hash}.mime")), mime);
        }
        if let Some(name) = name.map(sanitize_name).filter(|n| !n.is_empty()) {
            let _ = std::fs::write(dir.join(format!("{hash}.name")), name);
        }
        Ok(path)
    }

    pub fn cached_sidecars(&self, remote_hex: &str, hash: &str) -> (Option<String>, Option<String>) {
        let dir = self.in_dir(remote_hex);
        let mime = read_optional_sidecar(&dir.join(format!("{hash}.mime")));
        let name = read_optional_sidecar(&dir.join(format!("{hash}.name")));
        (mime, name)
    }
}

fn stat(path: &Path) -> io::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok((meta.len(), mtime))
}

fn read_sidecar(path: &Path) -> String {
    std::fs::read_to_string(path).map(|s| s.trim().to_string()).unwrap_or_default()
}

fn read_optional_sidecar(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_is_content_addressed_and_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());
        let descriptor = store.store(b"abc", "", "x.bin").expect("store");
        assert_eq!(descriptor.hash, content_hash_hex(b"abc"));
        assert_eq!(descriptor.size, 3);

        let bin = store.out_dir().join(format!("{}.bin", descriptor.hash));
        let mtime_before = std::fs::metadata(&bin).expect("stat").modified().expect("mtime");
        let again = store.store(b"abc", "", "x.bin").expect("store again");
        assert_eq!(again.hash, descriptor.hash);
        let mtime_after = std::fs::metadata(&bin).expect("stat").modified().expect("mtime");
        assert_eq!(mtime_before, mtime_after, "existing blob must not be rewritten");

        let entries: Vec<_> = std::fs::read_dir(store.out_dir())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "bin"))
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn load_round_trips_bytes_and_sidecars() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());
        let descriptor = store.store(b"payload", "application/pdf", "doc.pdf").expect("store");
        let loaded = store.load(&descriptor.hash).expect("load");
        assert_eq!(loaded.bytes, b"payload");
        assert_eq!(loaded.descriptor.mime, "application/pdf");
        assert_eq!(loaded.descriptor.name, "doc.pdf");
    }

    #[test]
    fn missing_sidecars_load_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());
        let descriptor = store.store(b"bare", "", "").expect("store");
        let loaded = store.load(&descriptor.hash).expect("load");
        assert_eq!(loaded.descriptor.mime, "");
        assert_eq!(loaded.descriptor.name, "");
        assert!(!store.out_dir().join(format!("{}.mime", descriptor.hash)).exists());
    }

    #[test]
    fn load_rejects_malformed_hashes() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());
        let err = store.load("../../etc/passwd").expect_err("must reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn sanitize_rewrites_forbidden_characters() {
        assert_eq!(sanitize_name("/tmp/evil/../x.bin"), "x.bin");
        assert_eq!(sanitize_name("C:\\temp\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_name("a:b\0c\nd"), "a_b_c_d");
        assert_eq!(sanitize_name(&"n".repeat(400)).chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn incoming_cache_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());
        let hash = content_hash_hex(b"abc");
        assert!(store.cached_incoming("peer00", &hash).is_none());
        let path = store
            .cache_incoming("peer00", &hash, b"abc", Some("text/plain"), Some("x.bin"))
            .expect("cache");
        assert_eq!(std::fs::read(&path).expect("read"), b"abc");
        assert_eq!(store.cached_incoming("peer00", &hash), Some(path));
        let (mime, name) = store.cached_sidecars("peer00", &hash);
        assert_eq!(mime.as_deref(), Some("text/plain"));
        assert_eq!(name.as_deref(), Some("x.bin"));
    }
}
