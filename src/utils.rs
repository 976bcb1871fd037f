//! Shared I/O utilities: hash abstractions for reading tracked-file bytes.

use std::io;

use sha1::{Digest, Sha1};

use crate::hash::{HashKind, get_hash_kind};

/// A hash abstraction over SHA-1 and SHA-256, implementing `std::io::Write`
/// so callers can feed bytes through incrementally (e.g. while streaming a
/// file) without branching on the selected algorithm.
#[derive(Clone)]
pub enum HashAlgorithm {
    Sha1(Sha1),
    Sha256(sha2::Sha256),
    // Future: support other hash algorithms
}
impl HashAlgorithm {
    /// Update hash with data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashAlgorithm::Sha1(hasher) => hasher.update(data),
            HashAlgorithm::Sha256(hasher) => hasher.update(data),
        }
    }
    /// Finalize and get hash result
    pub fn finalize(self) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1(hasher) => hasher.finalize().to_vec(),
            HashAlgorithm::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
    pub fn new() -> Self {
        match get_hash_kind() {
            HashKind::Sha1 => HashAlgorithm::Sha1(Sha1::new()),
            HashKind::Sha256 => HashAlgorithm::Sha256(sha2::Sha256::new()),
        }
    }
}
impl std::io::Write for HashAlgorithm {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::new()
    }
}
