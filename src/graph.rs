//! The build dependency graph.
//!
//! Nodes are compile/module/link/install actions, edges point from a node to
//! the nodes it depends on. Adjacency is stored in both directions so the
//! scheduler can walk dependents without a scan. The graph owns the module
//! provider map that wires C++20 `import` consumers behind the interface
//! units that produce their BMIs.

use crate::{
    artifacts::ArtifactId,
    error::{Error, Result},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    time::Duration,
};

/// Identifier of a node within one [`BuildGraph`].
pub type NodeId = u64;

/// What kind of action a node performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    /// Compile one translation unit to an object file.
    Compile,
    /// Compile a module interface unit to a BMI (and object file).
    CompileModule,
    /// Link objects into an executable or library; also used for archiving.
    Link,
    PrecompileHeader,
    /// Copy a produced artifact to its install location.
    Install,
    /// An arbitrary user command.
    Custom,
    /// Scan a source for module declarations; reserved for scan-ahead
    /// pipelines, the engine currently scans inline.
    ModuleScan,
}

/// Execution state of a node.
///
/// `Ready` is part of the vocabulary for observers; internally nodes move
/// Pending → Running at dispatch and readiness is computed on the fly by
/// [`BuildGraph::ready_nodes`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    /// Satisfied from the cache without executing; counts as completed for
    /// dependent readiness.
    Skipped,
}

impl NodeState {
    /// Whether dependents of a node in this state may run.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Skipped)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed | NodeState::Skipped)
    }
}

/// A single action in the build graph.
#[derive(Clone, Debug)]
pub struct BuildNode {
    pub id: NodeId,
    /// Display name, e.g. `compile:main.cpp` or `link:app`.
    pub name: String,
    pub kind: NodeKind,
    pub state: NodeState,
    /// Ids this node depends on.
    pub dependencies: Vec<NodeId>,
    /// Ids that depend on this node.
    pub dependents: Vec<NodeId>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// The command to execute, argv[0] first. Empty commands complete
    /// without spawning anything.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// For `CompileModule` nodes, the module this node provides.
    pub module_name: Option<String>,
    /// Back-reference into the artifact registry for producing nodes.
    pub artifact: Option<ArtifactId>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

impl BuildNode {
    fn new(id: NodeId, name: String, kind: NodeKind) -> Self {
        Self {
            id,
            name,
            kind,
            state: NodeState::Pending,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            command: Vec::new(),
            working_dir: None,
            module_name: None,
            artifact: None,
            error: None,
            execution_time: Duration::ZERO,
        }
    }
}

/// Node counts per state, as reported by [`BuildGraph::count_by_state`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StateCounts {
    /// No node can make progress anymore.
    pub fn is_done(&self) -> bool {
        self.pending + self.ready + self.running == 0
    }

    pub fn has_failed(&self) -> bool {
        self.failed > 0
    }
}

/// The build DAG.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: BTreeMap<NodeId, BuildNode>,
    module_providers: HashMap<String, NodeId>,
    /// Nodes with no dependents.
    roots: BTreeSet<NodeId>,
    /// Nodes with no dependencies.
    leaves: BTreeSet<NodeId>,
    next_id: NodeId,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self { next_id: 1, ..Default::default() }
    }

    /// Adds a node in `Pending` state. Until an edge touches it, the node is
    /// both a root and a leaf.
    pub fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let node = BuildNode::new(id, name.into(), kind);
        trace!(id, name = %node.name, ?kind, "added graph node");
        self.nodes.insert(id, node);
        self.roots.insert(id);
        self.leaves.insert(id);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&BuildNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut BuildNode> {
        self.nodes.get_mut(&id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Records that `dependent` needs `dependency` to finish first.
    ///
    /// Both adjacency lists are updated together; the dependent stops being a
    /// leaf and the dependency stops being a root.
    pub fn add_edge(&mut self, dependent: NodeId, dependency: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&dependency) {
            return Err(Error::NodeNotFound(dependency));
        }
        let Some(node) = self.nodes.get_mut(&dependent) else {
            return Err(Error::NodeNotFound(dependent));
        };
        node.dependencies.push(dependency);
        self.nodes.get_mut(&dependency).expect("checked above").dependents.push(dependent);
        self.leaves.remove(&dependent);
        self.roots.remove(&dependency);
        Ok(())
    }

    /// Records `node_id` as the provider of `module_name` and stores the name
    /// on the node. The last registration for a name wins.
    pub fn register_module_provider(&mut self, module_name: &str, node_id: NodeId) -> Result<()> {
        let node = self.nodes.get_mut(&node_id).ok_or(Error::NodeNotFound(node_id))?;
        node.module_name = Some(module_name.to_string());
        if let Some(prev) = self.module_providers.insert(module_name.to_string(), node_id) {
            if prev != node_id {
                warn!(module = module_name, prev, new = node_id, "module provider re-registered");
            }
        }
        Ok(())
    }

    /// The node providing `module_name`, if any.
    pub fn module_provider(&self, module_name: &str) -> Option<NodeId> {
        self.module_providers.get(module_name).copied()
    }

    /// Wires `node_id` behind the providers of every module it imports.
    ///
    /// Imports without a registered provider are skipped (they may be system
    /// or header-unit imports), as are self-imports of a module's own
    /// implementation and edges that already exist.
    pub fn resolve_module_dependencies(
        &mut self,
        node_id: NodeId,
        imported_modules: &[String],
    ) -> Result<()> {
        if !self.nodes.contains_key(&node_id) {
            return Err(Error::NodeNotFound(node_id));
        }
        for import in imported_modules {
            let Some(provider) = self.module_provider(import) else {
                trace!(module = %import, "no provider registered, skipping import edge");
                continue;
            };
            if provider == node_id {
                continue;
            }
            if self.nodes[&node_id].dependencies.contains(&provider) {
                continue;
            }
            self.add_edge(node_id, provider)?;
        }
        Ok(())
    }

    /// Whether the graph contains a dependency cycle.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        for &start in self.nodes.keys() {
            if visited.contains(&start) {
                continue;
            }
            visited.insert(start);
            on_stack.insert(start);
            let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
            while let Some(frame) = stack.last_mut() {
                let (node_id, child) = (frame.0, frame.1);
                let deps = &self.nodes[&node_id].dependencies;
                if child < deps.len() {
                    frame.1 += 1;
                    let next = deps[child];
                    if on_stack.contains(&next) {
                        return true;
                    }
                    if visited.insert(next) {
                        on_stack.insert(next);
                        stack.push((next, 0));
                    }
                } else {
                    on_stack.remove(&node_id);
                    stack.pop();
                }
            }
        }
        false
    }

    /// Kahn's algorithm; dependencies always precede their dependents in the
    /// returned order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: BTreeMap<NodeId, usize> =
            self.nodes.values().map(|n| (n.id, n.dependencies.len())).collect();
        let mut queue: VecDeque<NodeId> =
            in_degree.iter().filter(|(_, deg)| **deg == 0).map(|(id, _)| *id).collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &dependent in &self.nodes[&id].dependents {
                let deg = in_degree.get_mut(&dependent).expect("dependent exists");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::CycleDetected);
        }
        Ok(order)
    }

    /// Collects into `out` all `Pending` nodes whose dependencies have all
    /// completed or been skipped. This is the scheduler's dispatch set.
    pub fn ready_nodes(&self, out: &mut Vec<NodeId>) {
        out.clear();
        for node in self.nodes.values() {
            if node.state != NodeState::Pending {
                continue;
            }
            let ready = node
                .dependencies
                .iter()
                .all(|dep| self.nodes[dep].state.satisfies_dependents());
            if ready {
                out.push(node.id);
            }
        }
    }

    pub fn set_state(&mut self, id: NodeId, state: NodeState) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        trace!(id, name = %node.name, ?state, "node state transition");
        node.state = state;
        Ok(())
    }

    /// Transitions the node to `Failed` and records the error text.
    pub fn mark_failed(&mut self, id: NodeId, error: impl Into<String>) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        node.state = NodeState::Failed;
        node.error = Some(error.into());
        Ok(())
    }

    pub fn count_by_state(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for node in self.nodes.values() {
            match node.state {
                NodeState::Pending => counts.pending += 1,
                NodeState::Ready => counts.ready += 1,
                NodeState::Running => counts.running += 1,
                NodeState::Completed => counts.completed += 1,
                NodeState::Failed => counts.failed += 1,
                NodeState::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Returns every node to `Pending` and clears per-run bookkeeping.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.state = NodeState::Pending;
            node.error = None;
            node.execution_time = Duration::ZERO;
        }
    }

    /// Nodes no other node depends on.
    pub fn roots(&self) -> &BTreeSet<NodeId> {
        &self.roots
    }

    /// Nodes that depend on nothing.
    pub fn leaves(&self) -> &BTreeSet<NodeId> {
        &self.leaves
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Builder helpers producing the canonical node shapes the engine schedules.
impl BuildGraph {
    /// A `Compile` node turning `source` into `object`.
    pub fn add_compile_node(
        &mut self,
        source: &Path,
        object: &Path,
        command: Vec<String>,
    ) -> NodeId {
        let id = self.add_node(format!("compile:{}", utils::file_name(source)), NodeKind::Compile);
        let node = self.nodes.get_mut(&id).expect("just added");
        node.inputs.push(source.to_path_buf());
        node.outputs.push(object.to_path_buf());
        node.command = command;
        id
    }

    /// A `CompileModule` node producing `bmi` (and `object`) from a module
    /// interface unit, registered as the provider of `module_name`.
    pub fn add_module_node(
        &mut self,
        module_name: &str,
        source: &Path,
        bmi: &Path,
        object: &Path,
        command: Vec<String>,
    ) -> NodeId {
        let id = self.add_node(format!("module:{module_name}"), NodeKind::CompileModule);
        {
            let node = self.nodes.get_mut(&id).expect("just added");
            node.inputs.push(source.to_path_buf());
            node.outputs.push(bmi.to_path_buf());
            node.outputs.push(object.to_path_buf());
            node.command = command;
        }
        self.register_module_provider(module_name, id).expect("just added");
        id
    }

    /// A `Link` node (also used for archiving) depending on all
    /// `object_nodes`; its inputs are their object outputs. For module nodes
    /// the object is the last output (the first is the BMI).
    pub fn add_link_node(
        &mut self,
        name: &str,
        object_nodes: &[NodeId],
        output: &Path,
        command: Vec<String>,
    ) -> Result<NodeId> {
        let id = self.add_node(format!("link:{name}"), NodeKind::Link);
        for &object_node in object_nodes {
            let input = self
                .node(object_node)
                .ok_or(Error::NodeNotFound(object_node))?
                .outputs
                .last()
                .cloned();
            self.add_edge(id, object_node)?;
            let node = self.nodes.get_mut(&id).expect("just added");
            if let Some(input) = input {
                node.inputs.push(input);
            }
        }
        let node = self.nodes.get_mut(&id).expect("just added");
        node.outputs.push(output.to_path_buf());
        node.command = command;
        Ok(id)
    }

    /// A `PrecompileHeader` node turning `header` into `pch`.
    pub fn add_precompile_header_node(
        &mut self,
        header: &Path,
        pch: &Path,
        command: Vec<String>,
    ) -> NodeId {
        let id =
            self.add_node(format!("pch:{}", utils::file_name(header)), NodeKind::PrecompileHeader);
        let node = self.nodes.get_mut(&id).expect("just added");
        node.inputs.push(header.to_path_buf());
        node.outputs.push(pch.to_path_buf());
        node.command = command;
        id
    }

    /// An `Install` node copying `artifact` into `dest_dir`, behind
    /// `producer`. Install nodes carry no command; the scheduler copies
    /// natively.
    pub fn add_install_node(
        &mut self,
        artifact: &Path,
        dest_dir: &Path,
        producer: NodeId,
    ) -> Result<NodeId> {
        let id =
            self.add_node(format!("install:{}", utils::file_name(artifact)), NodeKind::Install);
        self.add_edge(id, producer)?;
        let node = self.nodes.get_mut(&id).expect("just added");
        node.inputs.push(artifact.to_path_buf());
        node.outputs.push(dest_dir.join(utils::file_name(artifact)));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_node_is_root_and_leaf() {
        let mut graph = BuildGraph::new();
        let id = graph.add_node("compile:foo.c", NodeKind::Compile);
        assert!(graph.roots().contains(&id));
        assert!(graph.leaves().contains(&id));
        assert_eq!(graph.total_nodes(), 1);
    }

    #[test]
    fn edges_maintain_bidirectional_adjacency() {
        let mut graph = BuildGraph::new();
        let foo = graph.add_node("compile:foo.c", NodeKind::Compile);
        let bar = graph.add_node("compile:bar.c", NodeKind::Compile);
        let link = graph.add_node("link:app", NodeKind::Link);
        graph.add_edge(link, foo).unwrap();
        graph.add_edge(link, bar).unwrap();

        assert_eq!(graph.node(link).unwrap().dependencies, vec![foo, bar]);
        assert_eq!(graph.node(foo).unwrap().dependents, vec![link]);
        assert_eq!(graph.node(bar).unwrap().dependents, vec![link]);

        // link gained dependencies, the compiles gained a dependent
        assert!(!graph.leaves().contains(&link));
        assert!(!graph.roots().contains(&foo));
        assert!(graph.roots().contains(&link));
        assert!(graph.leaves().contains(&foo));
    }

    #[test]
    fn add_edge_unknown_node() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node("a", NodeKind::Custom);
        assert!(matches!(graph.add_edge(a, 999), Err(Error::NodeNotFound(999))));
        assert!(matches!(graph.add_edge(999, a), Err(Error::NodeNotFound(999))));
    }

    #[test]
    fn compile_link_ready_progression() {
        let mut graph = BuildGraph::new();
        let foo = graph.add_node("compile:foo.c", NodeKind::Compile);
        let bar = graph.add_node("compile:bar.c", NodeKind::Compile);
        let link = graph.add_node("link:app", NodeKind::Link);
        graph.add_edge(link, foo).unwrap();
        graph.add_edge(link, bar).unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(foo) < pos(link));
        assert!(pos(bar) < pos(link));

        let mut ready = Vec::new();
        graph.ready_nodes(&mut ready);
        assert_eq!(ready, vec![foo, bar]);

        graph.set_state(foo, NodeState::Completed).unwrap();
        graph.ready_nodes(&mut ready);
        assert_eq!(ready, vec![bar]);

        graph.set_state(bar, NodeState::Skipped).unwrap();
        graph.ready_nodes(&mut ready);
        assert_eq!(ready, vec![link], "skipped dependencies satisfy dependents");
    }

    #[test]
    fn cycle_detection() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node("a", NodeKind::Custom);
        let b = graph.add_node("b", NodeKind::Custom);
        graph.add_edge(a, b).unwrap();
        assert!(!graph.has_cycle());
        graph.add_edge(b, a).unwrap();
        assert!(graph.has_cycle());
        assert!(matches!(graph.topological_order(), Err(Error::CycleDetected)));
    }

    #[test]
    fn self_cycle_is_detected() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node("a", NodeKind::Custom);
        graph.add_edge(a, a).unwrap();
        assert!(graph.has_cycle());
    }

    #[test]
    fn topological_order_covers_all_nodes() {
        let mut graph = BuildGraph::new();
        let ids: Vec<_> = (0..8).map(|i| graph.add_node(format!("n{i}"), NodeKind::Custom)).collect();
        // a couple of layers: 0..4 -> 4..6 -> 6..8
        for &upper in &ids[4..6] {
            for &lower in &ids[0..4] {
                graph.add_edge(upper, lower).unwrap();
            }
        }
        for &upper in &ids[6..8] {
            for &lower in &ids[4..6] {
                graph.add_edge(upper, lower).unwrap();
            }
        }
        let order = graph.topological_order().unwrap();
        assert_eq!(order.len(), ids.len());
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        for node in graph.nodes() {
            for &dep in &node.dependencies {
                assert!(pos(dep) < pos(node.id), "dependency must sort before dependent");
            }
        }
    }

    #[test]
    fn module_provider_ordering() {
        let mut graph = BuildGraph::new();
        let module = graph.add_module_node(
            "mymod",
            Path::new("mymod.cppm"),
            Path::new("mymod.pcm"),
            Path::new("mymod.o"),
            vec![],
        );
        let consumer = graph.add_compile_node(Path::new("main.cpp"), Path::new("main.o"), vec![]);
        graph.resolve_module_dependencies(consumer, &["mymod".to_string()]).unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(module) < pos(consumer));
        assert_eq!(graph.node(module).unwrap().module_name.as_deref(), Some("mymod"));
    }

    #[test]
    fn resolve_skips_missing_self_and_duplicate() {
        let mut graph = BuildGraph::new();
        let module = graph.add_module_node(
            "m",
            Path::new("m.cppm"),
            Path::new("m.pcm"),
            Path::new("m.o"),
            vec![],
        );
        let consumer = graph.add_compile_node(Path::new("a.cpp"), Path::new("a.o"), vec![]);

        // unknown module: ignored
        graph.resolve_module_dependencies(consumer, &["ghost".to_string()]).unwrap();
        assert!(graph.node(consumer).unwrap().dependencies.is_empty());

        // self import: ignored
        graph.resolve_module_dependencies(module, &["m".to_string()]).unwrap();
        assert!(graph.node(module).unwrap().dependencies.is_empty());

        // duplicate import: one edge
        let imports = vec!["m".to_string(), "m".to_string()];
        graph.resolve_module_dependencies(consumer, &imports).unwrap();
        graph.resolve_module_dependencies(consumer, &imports).unwrap();
        assert_eq!(graph.node(consumer).unwrap().dependencies, vec![module]);
    }

    #[test]
    fn provider_last_writer_wins() {
        let mut graph = BuildGraph::new();
        let first = graph.add_node("module:dup", NodeKind::CompileModule);
        let second = graph.add_node("module:dup2", NodeKind::CompileModule);
        graph.register_module_provider("dup", first).unwrap();
        graph.register_module_provider("dup", second).unwrap();
        assert_eq!(graph.module_provider("dup"), Some(second));
    }

    #[test]
    fn counts_and_reset() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node("a", NodeKind::Compile);
        let b = graph.add_node("b", NodeKind::Compile);
        let c = graph.add_node("c", NodeKind::Link);
        graph.set_state(a, NodeState::Completed).unwrap();
        graph.mark_failed(b, "compile error").unwrap();
        graph.set_state(c, NodeState::Skipped).unwrap();

        let counts = graph.count_by_state();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
        assert!(counts.is_done());
        assert!(counts.has_failed());

        graph.reset();
        let counts = graph.count_by_state();
        assert_eq!(counts.pending, 3);
        assert!(!counts.is_done());
        assert!(graph.node(b).unwrap().error.is_none());
    }

    #[test]
    fn link_node_collects_object_inputs() {
        let mut graph = BuildGraph::new();
        let foo = graph.add_compile_node(Path::new("foo.c"), Path::new("obj/foo.o"), vec![]);
        let bar = graph.add_compile_node(Path::new("bar.c"), Path::new("obj/bar.o"), vec![]);
        let link = graph
            .add_link_node("app", &[foo, bar], Path::new("bin/app"), vec!["cc".to_string()])
            .unwrap();

        let node = graph.node(link).unwrap();
        assert_eq!(node.inputs, vec![PathBuf::from("obj/foo.o"), PathBuf::from("obj/bar.o")]);
        assert_eq!(node.outputs, vec![PathBuf::from("bin/app")]);
        assert_eq!(node.dependencies, vec![foo, bar]);
    }

    #[test]
    fn install_node_shape() {
        let mut graph = BuildGraph::new();
        let link = graph.add_node("link:app", NodeKind::Link);
        let install = graph
            .add_install_node(Path::new("bin/app"), Path::new("/usr/local/bin"), link)
            .unwrap();
        let node = graph.node(install).unwrap();
        assert_eq!(node.kind, NodeKind::Install);
        assert_eq!(node.dependencies, vec![link]);
        assert_eq!(node.outputs, vec![PathBuf::from("/usr/local/bin/app")]);
        assert!(node.command.is_empty());
    }
}
