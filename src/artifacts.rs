//! Bookkeeping of named, typed build outputs.
//!
//! Every linked or archived output the engine produces is registered here
//! under a stable numeric id. The registry derives the on-disk path from the
//! artifact kind and the target platform, tracks validity bits and performs
//! transitive invalidation along artifact-level dependency edges.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

/// Stable identifier of a registered [`Artifact`].
pub type ArtifactId = u64;

/// The kind of a produced build output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    Executable,
    StaticLibrary,
    SharedLibrary,
    Object,
    /// A C++20 binary module interface.
    ModuleInterface,
    PrecompiledHeader,
}

impl ArtifactKind {
    /// The subdirectory under the output root this kind is placed in.
    pub fn subdir(&self) -> &'static str {
        match self {
            ArtifactKind::Executable => "bin",
            ArtifactKind::StaticLibrary | ArtifactKind::SharedLibrary => "lib",
            ArtifactKind::Object
            | ArtifactKind::ModuleInterface
            | ArtifactKind::PrecompiledHeader => "obj",
        }
    }

    /// The file extension for this kind on the given target platform.
    ///
    /// BMIs use the `.pcm` Clang convention on every platform.
    pub fn extension(&self, os: TargetOs) -> &'static str {
        match self {
            ArtifactKind::Executable => match os {
                TargetOs::Windows => ".exe",
                _ => "",
            },
            ArtifactKind::StaticLibrary => match os {
                TargetOs::Windows => ".lib",
                _ => ".a",
            },
            ArtifactKind::SharedLibrary => match os {
                TargetOs::Windows => ".dll",
                TargetOs::Macos => ".dylib",
                _ => ".so",
            },
            ArtifactKind::Object => match os {
                TargetOs::Windows => ".obj",
                _ => ".o",
            },
            ArtifactKind::ModuleInterface => ".pcm",
            ArtifactKind::PrecompiledHeader => ".pch",
        }
    }
}

/// The operating system artifacts are produced for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetOs {
    #[default]
    Linux,
    Macos,
    Windows,
    /// Any other unix-like; uses the Linux extension table.
    Other,
}

impl TargetOs {
    /// The platform the library itself was compiled for.
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::Macos
        } else if cfg!(target_os = "linux") {
            TargetOs::Linux
        } else {
            TargetOs::Other
        }
    }

    /// Parses an OS name as it appears in a target triple.
    pub fn from_triple_os(os: &str) -> Self {
        match os {
            "windows" => TargetOs::Windows,
            "macos" | "darwin" | "ios" => TargetOs::Macos,
            "linux" => TargetOs::Linux,
            _ => TargetOs::Other,
        }
    }
}

/// A named, typed build output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Artifact name without extension, e.g. `app` or `libfoo`.
    pub name: String,
    pub kind: ArtifactKind,
    pub output_path: PathBuf,
    /// Content hash of the produced file, set once the file exists.
    pub content_hash: Option<u64>,
    /// Size of the produced file in bytes.
    pub size: u64,
    /// Unix timestamp of the last validation.
    pub timestamp: i64,
    /// Ids of artifacts this artifact depends on (e.g. an executable on the
    /// static libraries linked into it).
    pub dependencies: Vec<ArtifactId>,
    /// Whether the on-disk output is up to date.
    pub valid: bool,
    /// Target triple the artifact was built for, if cross compiling.
    pub target_triple: Option<String>,
}

/// Registry of all artifacts the engine knows about.
///
/// Lookups are by id or by name; ids are assigned monotonically and never
/// reused within a session.
#[derive(Debug)]
pub struct ArtifactRegistry {
    artifacts: BTreeMap<ArtifactId, Artifact>,
    by_name: HashMap<String, ArtifactId>,
    output_dir: PathBuf,
    target_os: TargetOs,
    next_id: ArtifactId,
}

impl ArtifactRegistry {
    /// Creates an empty registry rooted at `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, target_os: TargetOs) -> Self {
        Self {
            artifacts: BTreeMap::new(),
            by_name: HashMap::new(),
            output_dir: output_dir.into(),
            target_os,
            next_id: 1,
        }
    }

    /// The output root all artifact paths live under.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Registers a new artifact and derives its output path as
    /// `{output_dir}/{subdir}/{name}{ext}`.
    ///
    /// The artifact starts out invalid; the engine marks it valid once the
    /// scheduler reports the producing node as completed. Re-registering an
    /// existing name keeps its id stable and refreshes kind, path and triple.
    pub fn register(
        &mut self,
        name: &str,
        kind: ArtifactKind,
        target_triple: Option<&str>,
    ) -> ArtifactId {
        if let Some(&id) = self.by_name.get(name) {
            let file_name = format!("{name}{}", kind.extension(self.target_os));
            let output_path = self.output_dir.join(kind.subdir()).join(file_name);
            if let Some(artifact) = self.artifacts.get_mut(&id) {
                artifact.kind = kind;
                artifact.output_path = output_path;
                artifact.target_triple = target_triple.map(str::to_string);
                artifact.valid = false;
                return id;
            }
        }
        let id = self.next_id;
        self.next_id += 1;

        let file_name = format!("{name}{}", kind.extension(self.target_os));
        let output_path = self.output_dir.join(kind.subdir()).join(file_name);
        trace!(name, ?kind, path = %output_path.display(), "registering artifact");

        let artifact = Artifact {
            id,
            name: name.to_string(),
            kind,
            output_path,
            content_hash: None,
            size: 0,
            timestamp: 0,
            dependencies: Vec::new(),
            valid: false,
            target_triple: target_triple.map(str::to_string),
        };
        self.artifacts.insert(id, artifact);
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, id: ArtifactId) -> Option<&Artifact> {
        self.artifacts.get(&id)
    }

    pub fn get_mut(&mut self, id: ArtifactId) -> Option<&mut Artifact> {
        self.artifacts.get_mut(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Artifact> {
        self.by_name.get(name).and_then(|id| self.artifacts.get(id))
    }

    /// Whether the artifact exists and its validity bit is set.
    pub fn is_valid(&self, id: ArtifactId) -> bool {
        self.artifacts.get(&id).map(|a| a.valid).unwrap_or(false)
    }

    /// Marks the artifact valid and records its current size, hash and
    /// timestamp from disk where available.
    pub fn mark_valid(&mut self, id: ArtifactId) -> Result<()> {
        let artifact = self.artifacts.get_mut(&id).ok_or(Error::ArtifactNotFound(id))?;
        if let Ok(meta) = fs::metadata(&artifact.output_path) {
            artifact.size = meta.len();
        }
        artifact.content_hash = crate::hash::hash_file(&artifact.output_path).ok();
        artifact.timestamp = crate::utils::unix_timestamp();
        artifact.valid = true;
        Ok(())
    }

    /// Records which artifacts `id` depends on; used by
    /// [`Self::invalidate_with_dependents`].
    pub fn set_dependencies(&mut self, id: ArtifactId, deps: Vec<ArtifactId>) -> Result<()> {
        let artifact = self.artifacts.get_mut(&id).ok_or(Error::ArtifactNotFound(id))?;
        artifact.dependencies = deps;
        Ok(())
    }

    /// Clears the validity bit of `id` and of every artifact that transitively
    /// depends on it.
    ///
    /// The walk follows reverse dependency edges; an artifact that is already
    /// invalid is not descended into again, so each artifact is visited at
    /// most once and the traversal terminates on any graph.
    pub fn invalidate_with_dependents(&mut self, id: ArtifactId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.artifacts.get_mut(&current) {
                Some(artifact) if artifact.valid || current == id => {
                    artifact.valid = false;
                    trace!(id = current, name = %artifact.name, "invalidated artifact");
                }
                _ => continue,
            }
            stack.extend(
                self.artifacts
                    .values()
                    .filter(|a| a.valid && a.dependencies.contains(&current))
                    .map(|a| a.id),
            );
        }
    }

    /// Creates the `bin`, `lib` and `obj` subdirectories under the output
    /// root. Already existing directories are fine.
    pub fn ensure_directories(&self) -> Result<()> {
        for subdir in ["bin", "lib", "obj"] {
            crate::utils::create_dir_all(&self.output_dir.join(subdir))?;
        }
        Ok(())
    }

    /// Best-effort removal of every registered output file. Each artifact is
    /// invalidated regardless of whether the unlink succeeded.
    pub fn clean(&mut self) {
        for artifact in self.artifacts.values_mut() {
            if let Err(err) = fs::remove_file(&artifact.output_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %artifact.output_path.display(), %err, "failed to remove artifact");
                }
            }
            artifact.valid = false;
        }
    }

    /// All registered artifacts in id order.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ArtifactRegistry {
        ArtifactRegistry::new("/tmp/ccforge-out", TargetOs::Linux)
    }

    #[test]
    fn extension_table() {
        use ArtifactKind::*;
        assert_eq!(Executable.extension(TargetOs::Linux), "");
        assert_eq!(Executable.extension(TargetOs::Windows), ".exe");
        assert_eq!(StaticLibrary.extension(TargetOs::Macos), ".a");
        assert_eq!(StaticLibrary.extension(TargetOs::Windows), ".lib");
        assert_eq!(SharedLibrary.extension(TargetOs::Linux), ".so");
        assert_eq!(SharedLibrary.extension(TargetOs::Macos), ".dylib");
        assert_eq!(SharedLibrary.extension(TargetOs::Windows), ".dll");
        assert_eq!(Object.extension(TargetOs::Other), ".o");
        assert_eq!(Object.extension(TargetOs::Windows), ".obj");
        assert_eq!(ModuleInterface.extension(TargetOs::Windows), ".pcm");
        assert_eq!(PrecompiledHeader.extension(TargetOs::Linux), ".pch");
    }

    #[test]
    fn register_derives_path() {
        let mut reg = registry();
        let id = reg.register("app", ArtifactKind::Executable, None);
        let artifact = reg.get(id).unwrap();
        assert_eq!(artifact.output_path, Path::new("/tmp/ccforge-out/bin/app"));
        assert!(!artifact.valid);

        let lib = reg.register("libbase", ArtifactKind::StaticLibrary, None);
        assert_eq!(reg.get(lib).unwrap().output_path, Path::new("/tmp/ccforge-out/lib/libbase.a"));
    }

    #[test]
    fn reregistering_keeps_id_stable() {
        let mut reg = registry();
        let first = reg.register("app", ArtifactKind::Executable, None);
        reg.get_mut(first).unwrap().valid = true;
        let second = reg.register("app", ArtifactKind::Executable, None);
        assert_eq!(first, second);
        assert!(!reg.is_valid(first), "re-registration resets validity");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookup_by_name() {
        let mut reg = registry();
        let id = reg.register("app", ArtifactKind::Executable, Some("x86_64-linux"));
        let artifact = reg.get_by_name("app").unwrap();
        assert_eq!(artifact.id, id);
        assert_eq!(artifact.target_triple.as_deref(), Some("x86_64-linux"));
    }

    #[test]
    fn transitive_invalidation() {
        let mut reg = registry();
        let base = reg.register("libbase", ArtifactKind::StaticLibrary, None);
        let app = reg.register("app", ArtifactKind::Executable, None);
        reg.set_dependencies(app, vec![base]).unwrap();
        reg.get_mut(base).unwrap().valid = true;
        reg.get_mut(app).unwrap().valid = true;

        reg.invalidate_with_dependents(base);
        assert!(!reg.is_valid(base));
        assert!(!reg.is_valid(app));
    }

    #[test]
    fn invalidation_stops_at_invalid_nodes() {
        let mut reg = registry();
        let a = reg.register("a", ArtifactKind::StaticLibrary, None);
        let b = reg.register("b", ArtifactKind::StaticLibrary, None);
        let c = reg.register("c", ArtifactKind::Executable, None);
        reg.set_dependencies(b, vec![a]).unwrap();
        reg.set_dependencies(c, vec![b]).unwrap();
        // b is already invalid, c is valid: the walk must still terminate and
        // leave c untouched since it only descends through valid dependents.
        reg.get_mut(a).unwrap().valid = true;
        reg.get_mut(c).unwrap().valid = true;

        reg.invalidate_with_dependents(a);
        assert!(!reg.is_valid(a));
        assert!(!reg.is_valid(b));
        assert!(reg.is_valid(c));
    }

    #[test]
    fn invalidation_handles_diamonds() {
        let mut reg = registry();
        let base = reg.register("base", ArtifactKind::StaticLibrary, None);
        let left = reg.register("left", ArtifactKind::StaticLibrary, None);
        let right = reg.register("right", ArtifactKind::StaticLibrary, None);
        let top = reg.register("top", ArtifactKind::Executable, None);
        reg.set_dependencies(left, vec![base]).unwrap();
        reg.set_dependencies(right, vec![base]).unwrap();
        reg.set_dependencies(top, vec![left, right]).unwrap();
        for id in [base, left, right, top] {
            reg.get_mut(id).unwrap().valid = true;
        }

        reg.invalidate_with_dependents(base);
        for id in [base, left, right, top] {
            assert!(!reg.is_valid(id));
        }
    }

    #[test]
    fn ensure_directories_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ArtifactRegistry::new(dir.path(), TargetOs::Linux);
        reg.ensure_directories().unwrap();
        reg.ensure_directories().unwrap();
        assert!(dir.path().join("bin").is_dir());
        assert!(dir.path().join("lib").is_dir());
        assert!(dir.path().join("obj").is_dir());
    }

    #[test]
    fn clean_unlinks_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = ArtifactRegistry::new(dir.path(), TargetOs::Linux);
        reg.ensure_directories().unwrap();
        let id = reg.register("app", ArtifactKind::Executable, None);
        let path = reg.get(id).unwrap().output_path.clone();
        std::fs::write(&path, b"binary").unwrap();
        reg.get_mut(id).unwrap().valid = true;

        reg.clean();
        assert!(!path.exists());
        assert!(!reg.is_valid(id));
    }
}
