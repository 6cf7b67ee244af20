//! Content and command-line fingerprints.
//!
//! Everything the cache keys on goes through this module: file contents,
//! compiler argv vectors and dependency sets are reduced to 64-bit xxh3
//! fingerprints. xxh3 is deterministic across platforms and fast enough to
//! rehash a whole project on every build; the cache does not need a
//! cryptographic digest, it needs a cheap one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Chunk size for streaming file hashes.
const FILE_CHUNK_SIZE: usize = 8 * 1024;

/// Hashes the contents of the file at `path` in 8 KiB chunks.
pub fn hash_file(path: &Path) -> Result<u64> {
    let mut file = File::open(path).map_err(|err| Error::io(err, path))?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; FILE_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|err| Error::io(err, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

/// Hashes a byte string in one shot.
pub fn hash_bytes(data: impl AsRef<[u8]>) -> u64 {
    xxh3_64(data.as_ref())
}

/// Hashes a sequence of strings with a NUL byte between entries, so that
/// `["-O", "2"]` and `["-O2"]` produce different fingerprints.
pub fn hash_strings<I, S>(strings: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Xxh3::new();
    let mut first = true;
    for s in strings {
        if !first {
            hasher.update(&[0u8]);
        }
        first = false;
        hasher.update(s.as_ref().as_bytes());
    }
    hasher.digest()
}

/// Hashes a sequence of 64-bit fingerprints in order.
///
/// Used to fold per-dependency content hashes into the single `deps_hash`
/// component of a [`CacheKey`].
pub fn hash_u64s(values: impl IntoIterator<Item = u64>) -> u64 {
    let mut hasher = Xxh3::new();
    for value in values {
        hasher.update(&value.to_le_bytes());
    }
    hasher.digest()
}

/// Identifies one cacheable compilation.
///
/// The three component fingerprints cover the source bytes, the exact command
/// line and the contents of every dependency (module BMIs, precompiled
/// headers). `combined` is derived from the three and is the cache's lookup
/// key; equality still requires all four fields to match, which guards cache
/// reuse against a collision on the combined hash alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub source_hash: u64,
    pub flags_hash: u64,
    pub deps_hash: u64,
    pub combined: u64,
}

impl CacheKey {
    /// Combines the three component fingerprints.
    pub fn compute(source_hash: u64, flags_hash: u64, deps_hash: u64) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(&source_hash.to_le_bytes());
        hasher.update(&flags_hash.to_le_bytes());
        hasher.update(&deps_hash.to_le_bytes());
        Self { source_hash, flags_hash, deps_hash, combined: hasher.digest() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_hash_matches_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.c");
        // larger than one chunk to exercise the streaming path
        let content = "int x;\n".repeat(4096);
        std::fs::write(&path, &content).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(content.as_bytes()));
    }

    #[test]
    fn file_hash_missing_file() {
        let err = hash_file(Path::new("/definitely/not/here.c")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn strings_are_boundary_safe() {
        assert_ne!(hash_strings(["-O", "2"]), hash_strings(["-O2"]));
        assert_ne!(hash_strings(["a", "bc"]), hash_strings(["ab", "c"]));
        assert_eq!(hash_strings(["-O2", "-g"]), hash_strings(["-O2", "-g"]));
    }

    #[test]
    fn empty_flag_lists_hash_equal() {
        let empty: [&str; 0] = [];
        assert_eq!(hash_strings(empty), hash_strings(empty));
    }

    #[test]
    fn cache_key_is_deterministic() {
        assert_eq!(CacheKey::compute(1, 2, 3), CacheKey::compute(1, 2, 3));
        assert_ne!(CacheKey::compute(1, 2, 3), CacheKey::compute(1, 2, 4));
        assert_ne!(CacheKey::compute(1, 2, 3).combined, CacheKey::compute(3, 2, 1).combined);
    }

    #[test]
    fn cache_key_equality_needs_all_components() {
        let a = CacheKey::compute(1, 2, 3);
        let mut forged = a;
        forged.source_hash ^= 1;
        assert_ne!(a, forged);
    }

    #[test]
    fn streamed_write_matches_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.c");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"void f() {}").unwrap();
        drop(f);
        let h1 = hash_file(&path).unwrap();
        std::fs::write(&path, b"void f() {}").unwrap();
        assert_eq!(h1, hash_file(&path).unwrap());
    }
}
