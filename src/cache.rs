//! Support for caching compilations.
//!
//! The cache maps a [`CacheKey`] (source, flags and dependency fingerprints
//! combined) to the output the compilation produced last time. The engine
//! consults it before scheduling and feeds fresh fingerprints back in after a
//! successful build. Between sessions the cache persists itself as a small
//! binary manifest; a manifest that fails to load is discarded and the build
//! starts from a cold cache rather than erroring.

use crate::{
    error::{Error, Result},
    hash::{self, CacheKey},
    utils,
};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

/// Magic bytes identifying a cache manifest file.
pub const MANIFEST_MAGIC: &[u8; 9] = b"OVO_CACHE";

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// File name of the manifest inside the cache directory.
pub const MANIFEST_FILENAME: &str = "manifest.bin";

/// A cached compilation: the key it was stored under, the output it produced
/// and the inputs that went into it.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub output_path: PathBuf,
    pub output_size: u64,
    /// Unix timestamp of when the entry was stored.
    pub timestamp: i64,
    /// Ordered input files, the primary source first.
    pub input_files: Vec<PathBuf>,
    /// Session-local flag: the entry was stored or re-validated this session.
    /// Never persisted.
    pub verified: bool,
}

/// Hit/miss/eviction counters for one cache instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Why a compilation cannot be served from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyReason {
    /// No entry exists for the computed key.
    NotCached,
    /// The source file is missing or unreadable.
    SourceModified,
    /// A dependency file is missing or unreadable.
    DependencyModified,
    /// The command line changed. The combined-key lookup reports this case as
    /// [`DirtyReason::NotCached`]; the variant exists for collaborators that
    /// can attribute a miss to its flags component.
    FlagsChanged,
    /// The cached output file no longer exists on disk.
    OutputMissing,
    /// An entry exists under the combined hash but its full key differs.
    CacheCorrupted,
}

/// Outcome of [`BuildCache::check_dirty`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyCheckResult {
    /// Reusable; carries the key the check was performed against.
    Clean(CacheKey),
    Dirty(DirtyReason),
}

impl DirtyCheckResult {
    pub fn is_clean(&self) -> bool {
        matches!(self, DirtyCheckResult::Clean(_))
    }
}

/// The incremental build cache.
///
/// Entries are keyed by the combined hash of their [`CacheKey`]; a per-path
/// memo of content hashes amortises repeated hashing of the same file within
/// one build.
#[derive(Debug)]
pub struct BuildCache {
    entries: BTreeMap<u64, CacheEntry>,
    file_hashes: HashMap<PathBuf, u64>,
    cache_dir: PathBuf,
    manifest_path: PathBuf,
    stats: CacheStats,
}

impl BuildCache {
    /// Opens the cache at `cache_dir`, creating the directory if needed.
    ///
    /// An existing manifest is loaded if it parses; any load failure is
    /// logged and the cache starts empty.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        utils::create_dir_all(&cache_dir)?;
        let manifest_path = cache_dir.join(MANIFEST_FILENAME);
        let mut cache = Self {
            entries: BTreeMap::new(),
            file_hashes: HashMap::new(),
            cache_dir,
            manifest_path,
            stats: CacheStats::default(),
        };
        if cache.manifest_path.exists() {
            match cache.load_manifest() {
                Ok(()) => trace!(entries = cache.entries.len(), "loaded cache manifest"),
                Err(err) => {
                    debug!(%err, "discarding unreadable cache manifest");
                    cache.entries.clear();
                }
            }
        }
        Ok(cache)
    }

    /// The directory this cache lives in.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Content hash of `path`, memoised per path for the current session.
    pub fn hash_file(&mut self, path: &Path) -> Result<u64> {
        if let Some(hash) = self.file_hashes.get(path) {
            return Ok(*hash);
        }
        let hash = hash::hash_file(path)?;
        self.file_hashes.insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    /// Seeds the hash memo with externally computed hashes, e.g. from a
    /// parallel pre-hashing pass over all sources.
    pub fn prime(&mut self, hashes: impl IntoIterator<Item = (PathBuf, u64)>) {
        self.file_hashes.extend(hashes);
    }

    /// Drops the memoised hash for `path` without touching entries. Needed
    /// when a build rewrites a file (BMIs, PCHs) that was hashed earlier in
    /// the same session.
    pub fn forget_file_hash(&mut self, path: &Path) {
        self.file_hashes.remove(path);
    }

    /// Decides whether a compilation of `source` with `flags` and the given
    /// dependency files can be served from the cache.
    ///
    /// The check classifies misses: an unreadable source or dependency, a key
    /// with no entry, an entry whose full key mismatches the combined hash,
    /// and a missing output file are all distinct reasons. Hit and miss
    /// counters are updated for every keyed lookup.
    pub fn check_dirty(
        &mut self,
        source: &Path,
        flags: &[String],
        deps: &[PathBuf],
    ) -> DirtyCheckResult {
        let source_hash = match self.hash_file(source) {
            Ok(hash) => hash,
            Err(_) => return DirtyCheckResult::Dirty(DirtyReason::SourceModified),
        };
        let mut dep_hashes = Vec::with_capacity(deps.len());
        for dep in deps {
            match self.hash_file(dep) {
                Ok(hash) => dep_hashes.push(hash),
                Err(_) => return DirtyCheckResult::Dirty(DirtyReason::DependencyModified),
            }
        }

        let flags_hash = hash::hash_strings(flags);
        let deps_hash = hash::hash_u64s(dep_hashes);
        let key = CacheKey::compute(source_hash, flags_hash, deps_hash);

        match self.entries.get(&key.combined) {
            None => {
                self.stats.misses += 1;
                trace!(source = %source.display(), "cache miss: not cached");
                return DirtyCheckResult::Dirty(DirtyReason::NotCached);
            }
            Some(entry) if entry.key != key => {
                self.stats.misses += 1;
                warn!(source = %source.display(), "cache miss: stored key mismatches combined hash");
                return DirtyCheckResult::Dirty(DirtyReason::CacheCorrupted);
            }
            Some(entry) if !entry.output_path.exists() => {
                self.stats.misses += 1;
                trace!(source = %source.display(), "cache miss: output missing");
                return DirtyCheckResult::Dirty(DirtyReason::OutputMissing);
            }
            Some(_) => {}
        }

        if let Some(entry) = self.entries.get_mut(&key.combined) {
            entry.verified = true;
        }
        self.stats.hits += 1;
        trace!(source = %source.display(), "cache hit");
        DirtyCheckResult::Clean(key)
    }

    /// Stores a fresh entry, replacing any prior entry under the same key.
    pub fn store(
        &mut self,
        key: CacheKey,
        output_path: impl Into<PathBuf>,
        output_size: u64,
        input_files: Vec<PathBuf>,
    ) {
        let entry = CacheEntry {
            key,
            output_path: output_path.into(),
            output_size,
            timestamp: utils::unix_timestamp(),
            input_files,
            verified: true,
        };
        if self.entries.insert(key.combined, entry).is_some() {
            trace!(combined = key.combined, "replaced cache entry");
        }
    }

    /// The cached output path for `key`, requiring a full key match.
    pub fn get_cached_output(&self, key: &CacheKey) -> Option<&Path> {
        let entry = self.entries.get(&key.combined)?;
        (entry.key == *key).then(|| entry.output_path.as_path())
    }

    /// Drops every entry that lists `path` among its inputs and forgets the
    /// file's memoised hash. Each dropped entry counts as an eviction.
    pub fn invalidate_file(&mut self, path: &Path) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.input_files.iter().any(|input| input == path));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(path = %path.display(), removed, "evicted cache entries");
        }
        self.stats.evictions += removed as u64;
        self.file_hashes.remove(path);
    }

    /// Serialises all entries to the manifest file, rewriting it whole.
    pub fn save_manifest(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(64 + self.entries.len() * 128);
        buf.extend_from_slice(MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in self.entries.values() {
            buf.extend_from_slice(&entry.key.source_hash.to_le_bytes());
            buf.extend_from_slice(&entry.key.flags_hash.to_le_bytes());
            buf.extend_from_slice(&entry.key.deps_hash.to_le_bytes());
            buf.extend_from_slice(&entry.key.combined.to_le_bytes());
            write_path(&mut buf, &entry.output_path);
            buf.extend_from_slice(&entry.output_size.to_le_bytes());
            buf.extend_from_slice(&entry.timestamp.to_le_bytes());
            buf.extend_from_slice(&(entry.input_files.len() as u32).to_le_bytes());
            for input in &entry.input_files {
                write_path(&mut buf, input);
            }
        }
        fs::write(&self.manifest_path, buf).map_err(|err| Error::io(err, &self.manifest_path))?;
        trace!(entries = self.entries.len(), path = %self.manifest_path.display(), "saved manifest");
        Ok(())
    }

    /// Reads the manifest file and replaces the in-memory entries with its
    /// contents. All loaded entries start out unverified.
    pub fn load_manifest(&mut self) -> Result<()> {
        let bytes =
            fs::read(&self.manifest_path).map_err(|err| Error::io(err, &self.manifest_path))?;
        let mut reader = ManifestReader::new(&bytes);

        let magic = reader.take(MANIFEST_MAGIC.len())?;
        if magic != MANIFEST_MAGIC.as_slice() {
            return Err(Error::InvalidFormat("bad magic".to_string()));
        }
        let version = reader.read_u32()?;
        if version != MANIFEST_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let entry_count = reader.read_u64()?;
        let mut entries = BTreeMap::new();
        for _ in 0..entry_count {
            let key = CacheKey {
                source_hash: reader.read_u64()?,
                flags_hash: reader.read_u64()?,
                deps_hash: reader.read_u64()?,
                combined: reader.read_u64()?,
            };
            let output_path = reader.read_path()?;
            let output_size = reader.read_u64()?;
            let timestamp = reader.read_i64()?;
            let input_count = reader.read_u32()?;
            let mut input_files = Vec::with_capacity(input_count as usize);
            for _ in 0..input_count {
                input_files.push(reader.read_path()?);
            }
            entries.insert(
                key.combined,
                CacheEntry { key, output_path, output_size, timestamp, input_files, verified: false },
            );
        }

        self.entries = entries;
        Ok(())
    }

    /// Drops all entries, the hash memo and the statistics. The cache
    /// directory path is preserved.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.file_hashes.clear();
        self.stats = CacheStats::default();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Hit rate in percent; `0.0` when nothing was looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.stats.hits + self.stats.misses;
        if total == 0 {
            return 0.0;
        }
        self.stats.hits as f64 / total as f64 * 100.0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn write_path(buf: &mut Vec<u8>, path: &Path) {
    let bytes = path.to_string_lossy();
    let bytes = bytes.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Cursor over the raw manifest bytes; every read fails with
/// [`Error::InvalidFormat`] once the buffer is exhausted.
struct ManifestReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ManifestReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(Error::InvalidFormat("truncated manifest".to_string()));
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_path(&mut self) -> Result<PathBuf> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidFormat("non-utf8 path".to_string()))?;
        Ok(PathBuf::from(s))
    }
}
