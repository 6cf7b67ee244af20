//! Error types for the build engine.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Various errors the build core can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Internal IO error with the offending path attached.
    #[error(transparent)]
    Io(#[from] IoError),
    /// An edge or state transition referenced a node id that is not in the graph.
    #[error("build graph node {0} not found")]
    NodeNotFound(u64),
    /// The build graph is not a DAG.
    #[error("circular dependency detected in build graph")]
    CycleDetected,
    /// The cache manifest on disk is not something we wrote.
    #[error("invalid cache manifest: {0}")]
    InvalidFormat(String),
    /// The cache manifest was written by an incompatible version.
    #[error("unsupported cache manifest version {0}")]
    UnsupportedVersion(u32),
    /// A requested build target was never registered with the engine.
    #[error("unknown build target \"{0}\"")]
    UnknownTarget(String),
    /// An artifact id that is not in the registry.
    #[error("artifact {0} not found in registry")]
    ArtifactNotFound(u64),
    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        IoError::new(err, path).into()
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }
}

/// A wrapper around `std::io::Error` that remembers which path the operation
/// was about, because a bare "No such file or directory" helps no one.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path the failing operation was performed on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying [`io::ErrorKind`].
    pub fn kind(&self) -> io::ErrorKind {
        self.io.kind()
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_displays_path() {
        let err = Error::io(io::Error::new(io::ErrorKind::NotFound, "gone"), "/tmp/missing.c");
        let msg = err.to_string();
        assert!(msg.contains("/tmp/missing.c"), "{msg}");
    }

    #[test]
    fn io_error_kind_is_preserved() {
        let err = IoError::new(io::Error::new(io::ErrorKind::PermissionDenied, "nope"), "x");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
