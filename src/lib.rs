#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{Error, IoError, Result};

pub mod hash;
pub use hash::CacheKey;

pub mod artifacts;
pub use artifacts::{Artifact, ArtifactId, ArtifactKind, ArtifactRegistry, TargetOs};

pub mod cache;
pub use cache::{BuildCache, CacheEntry, CacheStats, DirtyCheckResult, DirtyReason};

pub mod graph;
pub use graph::{BuildGraph, BuildNode, NodeId, NodeKind, NodeState, StateCounts};

pub mod scheduler;
pub use scheduler::{
    CancellationToken, ExecutionStats, Progress, Task, TaskAction, TaskResult, TaskScheduler,
};

mod engine;
pub use engine::{
    BuildEngine, BuildResult, BuildTarget, CrossTarget, EngineConfig, EngineStats, Profile,
    SourceFile, SourceKind, TargetKind,
};

pub mod parse;

pub mod report;

pub mod utils;

// Used by tests that want log output; keeping the dev-dependency referenced
// here silences `unused_crate_dependencies` for lib builds.
#[cfg(test)]
use pretty_assertions as _;
#[cfg(test)]
use tempfile as _;
#[cfg(test)]
use tracing_subscriber as _;
