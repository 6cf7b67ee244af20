//! The build engine façade.
//!
//! The engine owns the cache, the graph and the artifact registry. A build
//! turns the selected [`BuildTarget`]s into graph nodes, lets the cache mark
//! reusable compilations as skipped, hands the graph to the scheduler and
//! reconciles the results back into the cache and the registry.

use crate::{
    artifacts::{ArtifactId, ArtifactKind, ArtifactRegistry, TargetOs},
    cache::{BuildCache, CacheStats},
    error::{Error, Result},
    graph::{BuildGraph, NodeId, NodeKind, NodeState, StateCounts},
    hash::{self, CacheKey},
    parse, report,
    scheduler::TaskScheduler,
    utils,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// Optimisation profile applied to every compile in a build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Debug,
    Release,
    /// Optimised but with assertions kept.
    ReleaseSafe,
    ReleaseSmall,
    /// Caller-provided flags, used verbatim.
    Custom(Vec<String>),
}

impl Profile {
    /// Subdirectory under the output root this profile builds into.
    pub fn subdir(&self) -> &'static str {
        match self {
            Profile::Debug => "debug",
            Profile::Release => "release",
            Profile::ReleaseSafe => "release-safe",
            Profile::ReleaseSmall => "release-small",
            Profile::Custom(_) => "custom",
        }
    }

    /// The compiler flags this profile contributes.
    pub fn flags(&self) -> Vec<String> {
        let flags: &[&str] = match self {
            Profile::Debug => &["-O0", "-g"],
            Profile::Release => &["-O3", "-DNDEBUG"],
            Profile::ReleaseSafe => &["-O2"],
            Profile::ReleaseSmall => &["-Os", "-DNDEBUG"],
            Profile::Custom(flags) => return flags.clone(),
        };
        flags.iter().map(|s| s.to_string()).collect()
    }
}

/// Cross-compilation target description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossTarget {
    pub arch: String,
    pub os: String,
    pub abi: Option<String>,
    /// Passed to the compiler as `-mcpu={..}` when present.
    pub cpu_features: Option<String>,
}

impl CrossTarget {
    /// The `--target=` triple handed to the compiler.
    pub fn triple(&self) -> String {
        match &self.abi {
            Some(abi) => format!("{}-{}-{abi}", self.arch, self.os),
            None => format!("{}-{}", self.arch, self.os),
        }
    }

    pub fn target_os(&self) -> TargetOs {
        TargetOs::from_triple_os(&self.os)
    }
}

/// Engine configuration as handed over by the configuration layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub profile: Profile,
    /// Cross-compilation target; `None` builds for the host.
    pub target: Option<CrossTarget>,
    /// Parallel compiler processes; `0` uses the detected CPU count.
    pub max_jobs: usize,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Install a stdout reporter for progress lines.
    pub verbose: bool,
    /// Keep building independent nodes after a failure.
    pub keep_going: bool,
    /// Walk the graph without spawning processes.
    pub dry_run: bool,
    /// Ignore the cache entirely for this build.
    pub force_rebuild: bool,
    /// Emit `compile_commands.json` under the output dir.
    pub compile_commands: bool,
    /// C compiler executable.
    pub cc: String,
    /// C++ compiler executable.
    pub cxx: String,
    pub linker: String,
    pub archiver: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            target: None,
            max_jobs: 0,
            output_dir: PathBuf::from("build"),
            cache_dir: default_cache_dir(),
            verbose: false,
            keep_going: false,
            dry_run: false,
            force_rebuild: false,
            compile_commands: false,
            cc: "clang".to_string(),
            cxx: "clang++".to_string(),
            linker: "clang++".to_string(),
            archiver: "ar".to_string(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("ccforge")
}

/// What a [`BuildTarget`] produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    Executable,
    StaticLibrary,
    SharedLibrary,
    /// Compile only; the objects are linked into dependent targets.
    Object,
}

impl TargetKind {
    /// The artifact kind a linked target registers, `None` for object-only
    /// targets.
    pub fn artifact_kind(&self) -> Option<ArtifactKind> {
        match self {
            TargetKind::Executable => Some(ArtifactKind::Executable),
            TargetKind::StaticLibrary => Some(ArtifactKind::StaticLibrary),
            TargetKind::SharedLibrary => Some(ArtifactKind::SharedLibrary),
            TargetKind::Object => None,
        }
    }
}

/// Language/dialect of a source file, classified by extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    C,
    Cxx,
    /// A C++20 module interface unit.
    CxxModule,
    /// A C++20 module implementation unit.
    CxxModuleImpl,
    ObjC,
    ObjCxx,
    /// AT&T-syntax assembly (`.s`/`.S`).
    AsmAtt,
    /// Intel-syntax assembly (`.asm`).
    AsmIntel,
    Header,
}

impl SourceKind {
    /// Classifies a path by its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        // `.S` (preprocessed assembly) must not fold into `.s`
        let ext = path.extension()?.to_str()?;
        let kind = match ext {
            "c" => SourceKind::C,
            "cpp" | "cc" | "cxx" | "c++" => SourceKind::Cxx,
            "cppm" | "ixx" | "mpp" | "ccm" => SourceKind::CxxModule,
            "m" => SourceKind::ObjC,
            "mm" => SourceKind::ObjCxx,
            "s" | "S" => SourceKind::AsmAtt,
            "asm" => SourceKind::AsmIntel,
            "h" | "hpp" | "hh" | "hxx" | "inl" => SourceKind::Header,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether sources of this kind go through the C++ compiler.
    pub fn is_cxx(&self) -> bool {
        matches!(
            self,
            SourceKind::Cxx | SourceKind::CxxModule | SourceKind::CxxModuleImpl | SourceKind::ObjCxx
        )
    }

    /// Whether a compile node is emitted for this kind.
    pub fn is_compilable(&self) -> bool {
        !matches!(self, SourceKind::Header)
    }
}

/// One source file of a target, with optional module annotations. The engine
/// scans unannotated C++ sources itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: SourceKind,
    /// The module this file declares, for module units.
    pub module_name: Option<String>,
    /// Modules this file imports.
    pub imports: Vec<String>,
}

impl SourceFile {
    /// Classifies `path`; `None` for unrecognised extensions.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let kind = SourceKind::from_path(&path)?;
        Some(Self { path, kind, module_name: None, imports: Vec::new() })
    }
}

/// A named build target as handed over by the project layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub name: String,
    pub kind: TargetKind,
    pub sources: Vec<SourceFile>,
    pub include_dirs: Vec<PathBuf>,
    pub lib_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub defines: Vec<String>,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    /// Names of targets this target links against (or, for object-only
    /// dependencies, whose objects it absorbs).
    pub depends_on: Vec<String>,
    /// Header to precompile; every compile of this target uses the PCH.
    pub precompiled_header: Option<PathBuf>,
    /// Destination directory for an install step after linking.
    pub install_dir: Option<PathBuf>,
}

impl BuildTarget {
    pub fn new(name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sources: Vec::new(),
            include_dirs: Vec::new(),
            lib_dirs: Vec::new(),
            libraries: Vec::new(),
            defines: Vec::new(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            depends_on: Vec::new(),
            precompiled_header: None,
            install_dir: None,
        }
    }

    /// Adds sources, classifying each by extension. Unrecognised extensions
    /// are skipped with a warning.
    pub fn with_sources<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            let path = path.into();
            match SourceFile::from_path(path.clone()) {
                Some(source) => self.sources.push(source),
                None => warn!(path = %path.display(), "unrecognised source extension, skipping"),
            }
        }
        self
    }

    /// Adds every recognised source file under `dir`.
    pub fn with_source_dir(self, dir: impl AsRef<Path>) -> Self {
        let files = utils::source_files(dir.as_ref(), utils::SOURCE_EXTENSIONS);
        self.with_sources(files)
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_define(mut self, define: impl Into<String>) -> Self {
        self.defines.push(define.into());
        self
    }

    /// Declares a dependency on another target by name.
    pub fn with_dependency(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(target.into());
        self
    }
}

/// Outcome of one [`BuildEngine::build`] call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    /// Nodes that executed and completed.
    pub targets_built: usize,
    /// Nodes satisfied from the cache.
    pub targets_cached: usize,
    pub targets_failed: usize,
    pub total_time: Duration,
    /// Artifacts produced (or, in a dry run, that would be produced).
    pub artifacts: Vec<ArtifactId>,
    pub error_messages: Vec<String>,
}

impl BuildResult {
    fn failure(message: impl Into<String>, total_time: Duration) -> Self {
        Self {
            success: false,
            total_time,
            error_messages: vec![message.into()],
            ..Default::default()
        }
    }
}

/// Aggregated graph and cache counters for status displays.
#[derive(Clone, Copy, Debug)]
pub struct EngineStats {
    pub nodes: StateCounts,
    pub cache: CacheStats,
    pub cache_hit_rate: f64,
    pub artifacts: usize,
}

/// Per-target bookkeeping kept while a build's graph is alive.
#[derive(Debug, Default)]
struct ConstructedTarget {
    link_node: Option<NodeId>,
    artifact: Option<ArtifactId>,
    object_nodes: Vec<NodeId>,
    object_paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, PartialEq)]
enum VisitMark {
    InProgress,
    Done,
}

/// Orchestrates targets → graph → cache → scheduler → artifacts.
#[derive(Debug)]
pub struct BuildEngine {
    config: EngineConfig,
    cache: BuildCache,
    graph: BuildGraph,
    registry: ArtifactRegistry,
    targets: BTreeMap<String, BuildTarget>,
    constructed: HashMap<String, ConstructedTarget>,
}

impl BuildEngine {
    /// Creates an engine with an empty graph and target set; opens (or
    /// creates) the cache directory.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let target_os =
            config.target.as_ref().map(CrossTarget::target_os).unwrap_or_else(TargetOs::host);
        let profile_dir = config.output_dir.join(config.profile.subdir());
        let cache = BuildCache::new(&config.cache_dir)?;
        let registry = ArtifactRegistry::new(profile_dir, target_os);
        Ok(Self {
            config,
            cache,
            graph: BuildGraph::new(),
            registry,
            targets: BTreeMap::new(),
            constructed: HashMap::new(),
        })
    }

    /// Registers a target; a target with the same name is replaced.
    pub fn add_target(&mut self, target: BuildTarget) {
        self.targets.insert(target.name.clone(), target);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// Builds the named targets (all registered targets when empty),
    /// including their target-level dependencies.
    ///
    /// Per-node failures, unknown targets and dependency cycles come back as
    /// an unsuccessful [`BuildResult`]; `Err` is reserved for environment
    /// failures like an unwritable output directory.
    pub fn build(&mut self, target_names: &[&str]) -> Result<BuildResult> {
        let started = Instant::now();
        if self.config.verbose {
            let _ = report::set_default(report::BasicStdoutReporter);
        }

        self.graph = BuildGraph::new();
        self.constructed.clear();

        let requested: Vec<String> = if target_names.is_empty() {
            self.targets.keys().cloned().collect()
        } else {
            target_names.iter().map(|s| s.to_string()).collect()
        };

        let selection = match self.expand_selection(&requested) {
            Ok(selection) => selection,
            Err(err @ Error::UnknownTarget(_)) => {
                return Ok(BuildResult::failure(err.to_string(), started.elapsed()))
            }
            Err(Error::CycleDetected) => {
                return Ok(BuildResult::failure(
                    "Circular dependency detected in build graph",
                    started.elapsed(),
                ))
            }
            Err(err) => return Err(err),
        };
        debug!(?selection, "selected targets");

        self.registry.ensure_directories()?;

        for name in &selection {
            self.construct_target(name)?;
        }

        if self.graph.has_cycle() {
            return Ok(BuildResult::failure(
                "Circular dependency detected in build graph",
                started.elapsed(),
            ));
        }

        if self.config.compile_commands {
            if let Err(err) = self.write_compile_commands() {
                warn!(%err, "failed to write compile_commands.json");
            }
        }

        if !self.config.force_rebuild {
            let cached = self.apply_caching()?;
            debug!(cached, "marked cached nodes as skipped");
        }

        let reporter = report::get_default();
        reporter.on_build_started(self.graph.total_nodes());

        let scheduler = TaskScheduler::new(self.config.max_jobs, !self.config.keep_going)
            .with_progress(|progress| report::get_default().on_progress(progress));
        let stats = if self.config.dry_run {
            scheduler.execute_dry_run(&mut self.graph)?
        } else if scheduler.max_jobs() == 1 {
            scheduler.execute_sequential(&mut self.graph)?
        } else {
            scheduler.execute(&mut self.graph)?
        };

        if !self.config.dry_run {
            self.update_cache_from_results();
            if let Err(err) = self.cache.save_manifest() {
                warn!(%err, "failed to save cache manifest");
            }
        }

        let mut artifacts = Vec::new();
        for name in &selection {
            let Some(constructed) = self.constructed.get(name) else { continue };
            let (Some(link), Some(artifact)) = (constructed.link_node, constructed.artifact) else {
                continue;
            };
            match self.graph.node(link).map(|n| n.state) {
                Some(NodeState::Completed) | Some(NodeState::Skipped) => {
                    if !self.config.dry_run {
                        self.registry.mark_valid(artifact)?;
                    }
                    artifacts.push(artifact);
                }
                Some(NodeState::Failed) => self.registry.invalidate_with_dependents(artifact),
                _ => {}
            }
        }

        let mut error_messages = Vec::new();
        for node in self.graph.nodes() {
            if node.state == NodeState::Failed {
                let error = node.error.as_deref().unwrap_or("task failed");
                reporter.on_task_failed(&node.name, error, &[]);
                error_messages.push(format!("{}: {error}", node.name));
            }
        }

        let success = error_messages.is_empty();
        reporter.on_build_finished(&stats, success);

        Ok(BuildResult {
            success,
            targets_built: stats.completed_tasks,
            targets_cached: stats.skipped_tasks,
            targets_failed: stats.failed_tasks,
            total_time: started.elapsed(),
            artifacts,
            error_messages,
        })
    }

    /// Removes every produced artifact, clears the cache and deletes the
    /// output directory. A missing output directory is not an error.
    pub fn clean(&mut self) -> Result<()> {
        self.registry.clean();
        self.cache.clear();
        match fs::remove_dir_all(&self.config.output_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(err, &self.config.output_dir)),
        }
    }

    /// Graph and cache counters for the current session.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            nodes: self.graph.count_by_state(),
            cache: self.cache.stats(),
            cache_hit_rate: self.cache.hit_rate(),
            artifacts: self.registry.len(),
        }
    }

    /// Writes a Clang-compatible compilation database for every compile node
    /// of the current graph.
    pub fn write_compile_commands(&self) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct Entry<'a> {
            directory: String,
            arguments: &'a Vec<String>,
            file: String,
            output: String,
        }

        let directory = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let entries: Vec<Entry<'_>> = self
            .graph
            .nodes()
            .filter(|n| {
                matches!(n.kind, NodeKind::Compile | NodeKind::CompileModule)
                    && !n.command.is_empty()
            })
            .filter_map(|n| {
                Some(Entry {
                    directory: n
                        .working_dir
                        .as_deref()
                        .unwrap_or(directory.as_path())
                        .display()
                        .to_string(),
                    arguments: &n.command,
                    file: n.inputs.first()?.display().to_string(),
                    output: n.outputs.last()?.display().to_string(),
                })
            })
            .collect();

        let path = self.config.output_dir.join("compile_commands.json");
        utils::write_json_file(&entries, &path)?;
        Ok(path)
    }

    /// Expands the requested targets to a dependency-first construction
    /// order, failing on unknown names and target-level cycles.
    fn expand_selection(&self, names: &[String]) -> Result<Vec<String>> {
        let mut marks: HashMap<String, VisitMark> = HashMap::new();
        let mut order = Vec::new();
        for name in names {
            self.visit_target(name, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit_target(
        &self,
        name: &str,
        marks: &mut HashMap<String, VisitMark>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(VisitMark::Done) => return Ok(()),
            Some(VisitMark::InProgress) => return Err(Error::CycleDetected),
            None => {}
        }
        let target =
            self.targets.get(name).ok_or_else(|| Error::UnknownTarget(name.to_string()))?;
        marks.insert(name.to_string(), VisitMark::InProgress);
        for dep in &target.depends_on {
            self.visit_target(dep, marks, order)?;
        }
        marks.insert(name.to_string(), VisitMark::Done);
        order.push(name.to_string());
        Ok(())
    }

    /// Instantiates all nodes of one target. Dependency targets are already
    /// constructed at this point.
    fn construct_target(&mut self, name: &str) -> Result<()> {
        if self.constructed.contains_key(name) {
            return Ok(());
        }
        let target =
            self.targets.get(name).cloned().ok_or_else(|| Error::UnknownTarget(name.to_string()))?;
        debug!(target = name, sources = target.sources.len(), "constructing graph nodes");

        let obj_dir = self.obj_dir();
        let obj_ext = ArtifactKind::Object.extension(self.target_os());
        let sources: Vec<SourceFile> =
            target.sources.iter().map(|source| self.annotate_source(source)).collect();

        let mut pch_node = None;
        if let Some(header) = &target.precompiled_header {
            let pch_path = obj_dir.join(format!("{}.pch", utils::file_stem(header)));
            let command = self.pch_command(&target, header, &pch_path);
            pch_node = Some(self.graph.add_precompile_header_node(header, &pch_path, command));
        }
        let pch_path = pch_node
            .and_then(|id| self.graph.node(id))
            .and_then(|node| node.outputs.first().cloned());

        let mut object_nodes = Vec::new();
        let mut object_paths = Vec::new();
        let mut interface_imports: Vec<(NodeId, Vec<String>)> = Vec::new();

        // module interface units first, so every provider is registered
        // before any consumer resolves its imports
        for source in sources.iter().filter(|s| s.kind == SourceKind::CxxModule) {
            let module_name =
                source.module_name.clone().unwrap_or_else(|| utils::file_stem(&source.path));
            let bmi = obj_dir.join(format!("{module_name}.pcm"));
            let object = obj_dir.join(format!("{module_name}{obj_ext}"));
            let command = self.module_command(&target, source, &bmi, &object);
            let id = self.graph.add_module_node(&module_name, &source.path, &bmi, &object, command);
            if let Some(pch) = pch_node {
                self.graph.add_edge(id, pch)?;
            }
            if !source.imports.is_empty() {
                interface_imports.push((id, source.imports.clone()));
            }
            object_nodes.push(id);
            object_paths.push(object);
        }
        for (id, imports) in interface_imports {
            self.graph.resolve_module_dependencies(id, &imports)?;
        }

        for source in
            sources.iter().filter(|s| s.kind.is_compilable() && s.kind != SourceKind::CxxModule)
        {
            let object = obj_dir.join(format!("{}{obj_ext}", utils::file_stem(&source.path)));
            let command = self.compile_command(&target, source, &object, pch_path.as_deref());
            let id = self.graph.add_compile_node(&source.path, &object, command);
            if let Some(pch) = pch_node {
                self.graph.add_edge(id, pch)?;
            }
            let mut imports = source.imports.clone();
            if source.kind == SourceKind::CxxModuleImpl {
                // an implementation unit implicitly imports its own interface
                if let Some(module) = &source.module_name {
                    if !imports.contains(module) {
                        imports.push(module.clone());
                    }
                }
            }
            if !imports.is_empty() {
                self.graph.resolve_module_dependencies(id, &imports)?;
            }
            object_nodes.push(id);
            object_paths.push(object);
        }

        let Some(artifact_kind) = target.kind.artifact_kind() else {
            self.constructed.insert(
                name.to_string(),
                ConstructedTarget { link_node: None, artifact: None, object_nodes, object_paths },
            );
            return Ok(());
        };

        let mut dep_link_nodes = Vec::new();
        let mut dep_artifacts = Vec::new();
        let mut dep_libs = Vec::new();
        let mut all_object_nodes = object_nodes.clone();
        let mut all_object_paths = object_paths.clone();
        for dep_name in &target.depends_on {
            let Some(dep) = self.constructed.get(dep_name) else { continue };
            match (dep.link_node, dep.artifact) {
                (Some(link), Some(artifact)) => {
                    dep_link_nodes.push(link);
                    dep_artifacts.push(artifact);
                    if let Some(a) = self.registry.get(artifact) {
                        dep_libs.push(a.output_path.clone());
                    }
                }
                _ => {
                    // object-only dependencies contribute their objects
                    all_object_nodes.extend(dep.object_nodes.iter().copied());
                    all_object_paths.extend(dep.object_paths.iter().cloned());
                }
            }
        }

        let triple = self.config.target.as_ref().map(CrossTarget::triple);
        let artifact_id = self.registry.register(name, artifact_kind, triple.as_deref());
        self.registry.set_dependencies(artifact_id, dep_artifacts)?;
        let output_path = self
            .registry
            .get(artifact_id)
            .map(|a| a.output_path.clone())
            .ok_or(Error::ArtifactNotFound(artifact_id))?;

        let command = if artifact_kind == ArtifactKind::StaticLibrary {
            self.archive_command(&output_path, &all_object_paths)
        } else {
            self.link_command(&target, &output_path, &all_object_paths, &dep_libs)
        };
        let link_id = self.graph.add_link_node(name, &all_object_nodes, &output_path, command)?;
        for dep_link in dep_link_nodes {
            self.graph.add_edge(link_id, dep_link)?;
        }
        if let Some(node) = self.graph.node_mut(link_id) {
            node.artifact = Some(artifact_id);
        }

        if let Some(install_dir) = &target.install_dir {
            self.graph.add_install_node(&output_path, install_dir, link_id)?;
        }

        self.constructed.insert(
            name.to_string(),
            ConstructedTarget {
                link_node: Some(link_id),
                artifact: Some(artifact_id),
                object_nodes,
                object_paths,
            },
        );
        Ok(())
    }

    /// Fills in module name/imports by scanning the source when the project
    /// layer did not annotate it, and reclassifies plain C++ sources that
    /// turn out to be module units.
    fn annotate_source(&self, source: &SourceFile) -> SourceFile {
        let mut source = source.clone();
        let scannable = matches!(
            source.kind,
            SourceKind::Cxx | SourceKind::CxxModule | SourceKind::CxxModuleImpl
        );
        if !scannable || (source.module_name.is_some() && !source.imports.is_empty()) {
            return source;
        }
        match parse::scan_file(&source.path) {
            Ok(info) => {
                if source.module_name.is_none() {
                    source.module_name = info.module_name.clone();
                }
                if source.imports.is_empty() {
                    source.imports = info.imports;
                }
                if source.kind == SourceKind::Cxx && info.module_name.is_some() {
                    source.kind = if info.is_interface {
                        SourceKind::CxxModule
                    } else {
                        SourceKind::CxxModuleImpl
                    };
                }
            }
            Err(err) => trace!(path = %source.path.display(), %err, "module scan failed"),
        }
        source
    }

    /// Marks every compile node whose fingerprints match the cache as
    /// skipped. Returns the number of skipped nodes.
    ///
    /// Walks in topological order: a node whose module/PCH provider is itself
    /// dirty is never cache-checked, because the provider's output is about
    /// to change under it.
    fn apply_caching(&mut self) -> Result<usize> {
        let sources: Vec<PathBuf> = self
            .graph
            .nodes()
            .filter(|n| matches!(n.kind, NodeKind::Compile | NodeKind::CompileModule))
            .filter_map(|n| n.inputs.first().cloned())
            .collect();
        let hashed: Vec<(PathBuf, u64)> = sources
            .par_iter()
            .filter_map(|path| hash::hash_file(path).ok().map(|h| (path.clone(), h)))
            .collect();
        self.cache.prime(hashed);

        let order = self.graph.topological_order()?;
        let mut skipped = 0;
        for id in order {
            let Some((source, command)) = self.cacheable_node(id) else { continue };
            if !self.compile_deps_skipped(id) {
                trace!(node = id, "provider is dirty, recompiling");
                continue;
            }
            let deps = self.dependency_paths(id);
            if self.cache.check_dirty(&source, &command, &deps).is_clean() {
                self.graph.set_state(id, NodeState::Skipped)?;
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    /// Stores fresh fingerprints for every compile node that executed.
    fn update_cache_from_results(&mut self) {
        let completed: Vec<NodeId> = self
            .graph
            .nodes()
            .filter(|n| n.state == NodeState::Completed)
            .map(|n| n.id)
            .collect();

        // outputs were rewritten; their memoised hashes are stale
        for &id in &completed {
            if let Some(node) = self.graph.node(id) {
                for output in node.outputs.clone() {
                    self.cache.forget_file_hash(&output);
                }
            }
        }

        for &id in &completed {
            let Some((source, command)) = self.cacheable_node(id) else { continue };
            let Some(output) =
                self.graph.node(id).and_then(|node| node.outputs.first().cloned())
            else {
                continue;
            };

            let source_hash = match self.cache.hash_file(&source) {
                Ok(hash) => hash,
                Err(err) => {
                    warn!(path = %source.display(), %err, "skipping cache update");
                    continue;
                }
            };
            let deps = self.dependency_paths(id);
            let mut dep_hashes = Vec::with_capacity(deps.len());
            let mut hashed_all = true;
            for dep in &deps {
                match self.cache.hash_file(dep) {
                    Ok(hash) => dep_hashes.push(hash),
                    Err(err) => {
                        warn!(path = %dep.display(), %err, "skipping cache update");
                        hashed_all = false;
                        break;
                    }
                }
            }
            if !hashed_all {
                continue;
            }

            let flags_hash = hash::hash_strings(&command);
            let key = CacheKey::compute(source_hash, flags_hash, hash::hash_u64s(dep_hashes));
            let output_size = utils::file_size(&output).unwrap_or_default();
            let mut input_files = vec![source];
            input_files.extend(deps);
            self.cache.store(key, output, output_size, input_files);
        }
    }

    /// Source and command of a cache-checkable node.
    fn cacheable_node(&self, id: NodeId) -> Option<(PathBuf, Vec<String>)> {
        let node = self.graph.node(id)?;
        if !matches!(node.kind, NodeKind::Compile | NodeKind::CompileModule) {
            return None;
        }
        let source = node.inputs.first()?.clone();
        Some((source, node.command.clone()))
    }

    /// Whether every compile-producing dependency of `id` was skipped, i.e.
    /// none of its BMIs/PCHs will be rewritten by this build.
    fn compile_deps_skipped(&self, id: NodeId) -> bool {
        let Some(node) = self.graph.node(id) else { return false };
        node.dependencies.iter().all(|dep| match self.graph.node(*dep) {
            Some(d) => {
                !matches!(d.kind, NodeKind::CompileModule | NodeKind::PrecompileHeader)
                    || d.state == NodeState::Skipped
            }
            None => true,
        })
    }

    /// The dependency files folded into a node's cache key: the BMIs of the
    /// modules it imports and the PCH it includes.
    fn dependency_paths(&self, id: NodeId) -> Vec<PathBuf> {
        let Some(node) = self.graph.node(id) else { return Vec::new() };
        node.dependencies
            .iter()
            .filter_map(|dep| {
                let d = self.graph.node(*dep)?;
                match d.kind {
                    NodeKind::CompileModule | NodeKind::PrecompileHeader => {
                        d.outputs.first().cloned()
                    }
                    _ => None,
                }
            })
            .collect()
    }

    fn target_os(&self) -> TargetOs {
        self.config.target.as_ref().map(CrossTarget::target_os).unwrap_or_else(TargetOs::host)
    }

    fn obj_dir(&self) -> PathBuf {
        self.registry.output_dir().join("obj")
    }

    fn compiler_for(&self, kind: SourceKind) -> &str {
        if kind.is_cxx() {
            &self.config.cxx
        } else {
            &self.config.cc
        }
    }

    fn compile_command(
        &self,
        target: &BuildTarget,
        source: &SourceFile,
        object: &Path,
        pch: Option<&Path>,
    ) -> Vec<String> {
        let mut cmd = vec![
            self.compiler_for(source.kind).to_string(),
            "-c".to_string(),
            "-o".to_string(),
            object.display().to_string(),
            source.path.display().to_string(),
        ];
        cmd.extend(self.config.profile.flags());
        if source.kind == SourceKind::AsmIntel {
            cmd.push("-masm=intel".to_string());
        }
        if target.kind == TargetKind::SharedLibrary {
            cmd.push("-fPIC".to_string());
        }
        if source.kind == SourceKind::CxxModuleImpl || !source.imports.is_empty() {
            cmd.push("-fmodules".to_string());
            cmd.push(format!("-fprebuilt-module-path={}", self.obj_dir().display()));
        }
        if let Some(pch) = pch {
            cmd.push("-include-pch".to_string());
            cmd.push(pch.display().to_string());
        }
        for dir in &target.include_dirs {
            cmd.push(format!("-I{}", dir.display()));
        }
        for define in &target.defines {
            cmd.push(format!("-D{define}"));
        }
        cmd.extend(target.cflags.iter().cloned());
        self.push_cross_flags(&mut cmd);
        cmd
    }

    fn module_command(
        &self,
        target: &BuildTarget,
        source: &SourceFile,
        bmi: &Path,
        object: &Path,
    ) -> Vec<String> {
        let mut cmd = vec![
            self.config.cxx.clone(),
            "-c".to_string(),
            "-o".to_string(),
            object.display().to_string(),
            source.path.display().to_string(),
        ];
        cmd.extend(self.config.profile.flags());
        cmd.push("-fmodules".to_string());
        cmd.push(format!("-fmodule-output={}", bmi.display()));
        cmd.push(format!("-fprebuilt-module-path={}", self.obj_dir().display()));
        if target.kind == TargetKind::SharedLibrary {
            cmd.push("-fPIC".to_string());
        }
        for dir in &target.include_dirs {
            cmd.push(format!("-I{}", dir.display()));
        }
        for define in &target.defines {
            cmd.push(format!("-D{define}"));
        }
        cmd.extend(target.cflags.iter().cloned());
        self.push_cross_flags(&mut cmd);
        cmd
    }

    fn link_command(
        &self,
        target: &BuildTarget,
        output: &Path,
        objects: &[PathBuf],
        dep_libs: &[PathBuf],
    ) -> Vec<String> {
        let mut cmd = vec![self.config.linker.clone()];
        if target.kind == TargetKind::SharedLibrary {
            cmd.push("-shared".to_string());
        }
        cmd.push("-o".to_string());
        cmd.push(output.display().to_string());
        cmd.extend(objects.iter().map(|p| p.display().to_string()));
        cmd.extend(dep_libs.iter().map(|p| p.display().to_string()));
        for dir in &target.lib_dirs {
            cmd.push(format!("-L{}", dir.display()));
        }
        for lib in &target.libraries {
            cmd.push(format!("-l{lib}"));
        }
        cmd.extend(target.ldflags.iter().cloned());
        if let Some(t) = &self.config.target {
            cmd.push(format!("--target={}", t.triple()));
        }
        cmd
    }

    fn archive_command(&self, output: &Path, objects: &[PathBuf]) -> Vec<String> {
        let mut cmd =
            vec![self.config.archiver.clone(), "rcs".to_string(), output.display().to_string()];
        cmd.extend(objects.iter().map(|p| p.display().to_string()));
        cmd
    }

    fn pch_command(&self, target: &BuildTarget, header: &Path, pch: &Path) -> Vec<String> {
        let mut cmd = vec![
            self.config.cxx.clone(),
            "-x".to_string(),
            "c++-header".to_string(),
            header.display().to_string(),
            "-o".to_string(),
            pch.display().to_string(),
        ];
        cmd.extend(self.config.profile.flags());
        for dir in &target.include_dirs {
            cmd.push(format!("-I{}", dir.display()));
        }
        for define in &target.defines {
            cmd.push(format!("-D{define}"));
        }
        cmd.extend(target.cflags.iter().cloned());
        self.push_cross_flags(&mut cmd);
        cmd
    }

    fn push_cross_flags(&self, cmd: &mut Vec<String>) {
        if let Some(t) = &self.config.target {
            cmd.push(format!("--target={}", t.triple()));
            if let Some(features) = &t.cpu_features {
                cmd.push(format!("-mcpu={features}"));
            }
        }
    }
}
