//! [`DekBytes`]: 256-bit data encryption keys held in zeroizing buffers.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use common::{CleanroomError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

/// Byte length of a DEK (32 bytes = 256 bits).
pub const DEK_LEN: usize = 32;

/// Fixed-size key buffer of exactly [`DEK_LEN`] bytes.
///
/// Overwritten with zeroes on drop.
pub struct DekBytes(Box<[u8; DEK_LEN]>);

impl Drop for DekBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for DekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("DekBytes([REDACTED])")
    }
}

impl DekBytes {
    /// Fresh random key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut buf = Box::new([0u8; DEK_LEN]);
        OsRng.fill_bytes(buf.as_mut_slice());
        Self(buf)
    }

    /// Copy from `bytes`, which must be exactly [`DEK_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DEK_LEN {
            return Err(CleanroomError::Crypto(format!(
                "DEK has invalid length: expected {DEK_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = Box::new([0u8; DEK_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Read a key file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = std::fs::read(path).map_err(|e| CleanroomError::io(path, e))?;
        let key = Self::from_slice(&bytes).map_err(|e| match e {
            CleanroomError::Crypto(m) => CleanroomError::Crypto(format!("{}: {m}", path.display())),
            other => other,
        });
        bytes.zeroize();
        key
    }

    /// Generate a key and write it to `path`, which must not exist yet.
    ///
    /// Returns `Ok(false)` without touching the file if it already exists.
    pub fn create_if_absent(path: &Path) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(CleanroomError::io(path, e)),
        };
        let key = Self::generate();
        file.write_all(key.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| CleanroomError::io(path, e))?;
        Ok(true)
    }
}
