//! On-disk persistence of the local avatar blob.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::support::now_epoch_secs;
use crate::wire::AvatarAnnounce;

pub const AVATAR_FINGERPRINT_LEN: usize = 16;

const AVATAR_BIN: &str = "avatar.bin";
const AVATAR_MIME: &str = "avatar.mime";
const AVATAR_LEGACY_PNG: &str = "avatar.png";

const ALLOWED_MIMES: &[&str] = &["image/png", "image/jpeg", "image/heic"];

/// The local avatar. When `bytes` is empty every other field is zeroed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvatarRecord {
    pub bytes: Vec<u8>,
    pub fingerprint: [u8; AVATAR_FINGERPRINT_LEN],
    pub mime: String,
    pub mtime: u64,
}

impl AvatarRecord {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Metadata as carried in announces; `None` while no avatar is set.
    pub fn announce_entry(&self) -> Option<AvatarAnnounce> {
        if self.is_empty() {
            return None;
        }
        Some(AvatarAnnounce {
            fingerprint: self.fingerprint.to_vec(),
            mime: self.mime.clone(),
            size: self.size(),
            mtime: self.mtime,
        })
    }
}

/// Leading bytes of the SHA-256 over the avatar bytes.
pub fn fingerprint(bytes: &[u8]) -> [u8; AVATAR_FINGERPRINT_LEN] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; AVATAR_FINGERPRINT_LEN];
    out.copy_from_slice(&digest[..AVATAR_FINGERPRINT_LEN]);
    out
}

/// Sniff the image type from magic bytes. Unknown formats yield "".
pub fn detect_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return "image/png";
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        let brand = &bytes[8..12];
        if matches!(brand, b"heic" | b"heix" | b"hevc" | b"heif" | b"mif1" | b"msf1") {
            return "image/heic";
        }
    }
    ""
}

pub struct AvatarStore {
    dir: PathBuf,
}

impl AvatarStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn bin_path(&self) -> PathBuf {
        self.dir.join(AVATAR_BIN)
    }

    fn mime_path(&self) -> PathBuf {
        self.dir.join(AVATAR_MIME)
    }

    /// Load the persisted avatar; falls back to the legacy `avatar.png`
    /// location. Never fails: unreadable state loads as the empty record.
    pub fn load(&self) -> AvatarRecord {
        let (bytes, mime, mtime) = match read_with_mtime(&self.bin_path()) {
            Some((bytes, mtime)) => {
                let mime = std::fs::read_to_string(self.mime_path())
                    .map(|m| m.trim().to_string())
                    .unwrap_or_default();
                (bytes, mime, mtime)
            }
            None => match read_with_mtime(&self.dir.join(AVATAR_LEGACY_PNG)) {
                Some((bytes, mtime)) => (bytes, "image/png".to_string(), mtime),
                None => return AvatarRecord::default(),
            },
        };
        if bytes.is_empty() {
            return AvatarRecord::default();
        }
        let fingerprint = fingerprint(&bytes);
        AvatarRecord { bytes, fingerprint, mime, mtime }
    }

    /// Persist a new avatar. An empty or unrecognised mime is replaced by
    /// what the magic bytes say.
    pub fn set(&self, bytes: Vec<u8>, mime: &str) -> io::Result<AvatarRecord> {
        if bytes.is_empty() {
            self.clear()?;
            return Ok(AvatarRecord::default());
        }
        let mime = if ALLOWED_MIMES.contains(&mime) {
            mime.to_string()
        } else {
            detect_image_mime(&bytes).to_string()
        };
        // tmp-then-rename keeps a concurrent responder off half-written bytes
        let tmp = self.dir.join(format!("{AVATAR_BIN}.tmp"));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.bin_path())?;
        std::fs::write(self.mime_path(), &mime)?;
        let fingerprint = fingerprint(&bytes);
        Ok(AvatarRecord { bytes, fingerprint, mime, mtime: now_epoch_secs() })
    }

    pub fn clear(&self) -> io::Result<()> {
        for path in [self.bin_path(), self.mime_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn read_with_mtime(path: &Path) -> Option<(Vec<u8>, u64)> {
    let bytes = std::fs::read(path).ok()?;
    let mtime = std::fs::metadata(path)
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some((bytes, mtime))
}
