//! Module graph data structures

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Index of a module in the graph, in deterministic traversal order
pub type ModuleId = usize;

/// Content type of a module, derived from its file extension
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentType {
    JavaScript,
    Jsx,
    TypeScript,
    Tsx,
    Css,
    Less,
    Json,
    Other(String),
}

impl ContentType {
    /// Determine content type from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "js" | "mjs" | "cjs" => ContentType::JavaScript,
            "jsx" => ContentType::Jsx,
            "ts" | "mts" | "cts" => ContentType::TypeScript,
            "tsx" => ContentType::Tsx,
            "css" => ContentType::Css,
            "less" => ContentType::Less,
            "json" => ContentType::Json,
            other => ContentType::Other(other.to_string()),
        }
    }

    /// Detect content type from a path
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(ContentType::from_extension)
            .unwrap_or_else(|| ContentType::Other(String::new()))
    }

    /// Key used for this type in `[transforms.<key>]`
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::JavaScript => "js",
            ContentType::Jsx => "jsx",
            ContentType::TypeScript => "ts",
            ContentType::Tsx => "tsx",
            ContentType::Css => "css",
            ContentType::Less => "less",
            ContentType::Json => "json",
            ContentType::Other(ext) => ext,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an import is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportKind {
    /// Resolved and loaded together with the importer
    Sync,
    /// Loaded on demand through a separate chunk
    Deferred,
}

/// An unresolved import reference reported by a transform stage
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImportRef {
    pub specifier: String,
    pub kind: ImportKind,
}

impl ImportRef {
    pub fn sync(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            kind: ImportKind::Sync,
        }
    }

    pub fn deferred(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            kind: ImportKind::Deferred,
        }
    }
}

/// A side-channel artifact attached to a module by a transform stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxAsset {
    /// Output extension, e.g. `css`
    pub ext: String,
    pub content: String,
}

/// A file copied to the output directory under its own hashed name, such as
/// an image referenced from a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFile {
    /// File name relative to the output directory
    pub filename: String,
    pub contents: Vec<u8>,
}

/// A module in the dependency graph
#[derive(Debug, Clone)]
pub struct Module {
    /// Canonical absolute path; the module identity
    pub path: PathBuf,

    /// Short stable key used in emitted code
    pub key: String,

    /// Content type
    pub content_type: ContentType,

    /// Raw file contents as read
    pub source: Vec<u8>,

    /// Source after all transform stages
    pub transformed: String,

    /// Import references in source order
    pub imports: Vec<ImportRef>,

    /// Auxiliary artifacts extracted by transform stages
    pub assets: Vec<AuxAsset>,

    /// Files emitted next to the bundles
    pub files: Vec<EmittedFile>,

    /// Entry name, if this module is an entry point
    pub entry: Option<String>,
}

/// A resolved dependency edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub from: ModuleId,
    pub to: ModuleId,
    pub kind: ImportKind,
    /// The specifier as written in the importer
    pub specifier: String,
}

/// The module dependency graph
#[derive(Debug, Default)]
pub struct ModuleGraph {
    /// Modules in traversal order; the index is the module ID
    modules: Vec<Module>,

    /// Map from path to module ID
    path_to_id: HashMap<PathBuf, ModuleId>,

    /// Outgoing edges per module, in import order
    edges: Vec<Vec<Dependency>>,

    /// Entry name -> module ID, in declaration order
    entries: Vec<(String, ModuleId)>,
}

impl ModuleGraph {
    /// Create a new empty module graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module to the graph
    pub fn add_module(&mut self, module: Module) -> ModuleId {
        if let Some(&id) = self.path_to_id.get(&module.path) {
            return id;
        }

        let id = self.modules.len();
        self.path_to_id.insert(module.path.clone(), id);
        self.modules.push(module);
        self.edges.push(Vec::new());

        id
    }

    /// Add a dependency edge between modules
    ///
    /// Edges must point at modules already in the graph. Two specifiers that
    /// resolve to the same module keep separate edges.
    pub fn add_dependency(&mut self, dependency: Dependency) {
        debug_assert!(dependency.to < self.modules.len());
        if let Some(deps) = self.edges.get_mut(dependency.from) {
            if !deps.contains(&dependency) {
                deps.push(dependency);
            }
        }
    }

    /// Register a module as the entry point for `name`
    pub fn add_entry(&mut self, name: String, id: ModuleId) {
        if let Some(module) = self.modules.get_mut(id) {
            module.entry.get_or_insert_with(|| name.clone());
        }
        self.entries.push((name, id));
    }

    /// Get module ID from path
    pub fn get_module_id(&self, path: &Path) -> Option<ModuleId> {
        self.path_to_id.get(path).copied()
    }

    /// Get a module by ID
    pub fn get_module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    /// Iterate over all modules with their IDs
    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules.iter().enumerate()
    }

    /// Entry points in declaration order
    pub fn entries(&self) -> &[(String, ModuleId)] {
        &self.entries
    }

    /// Outgoing edges of a module, in import order
    pub fn dependencies(&self, id: ModuleId) -> &[Dependency] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct synchronous dependencies of a module
    pub fn sync_dependencies(&self, id: ModuleId) -> impl Iterator<Item = ModuleId> + '_ {
        self.dependencies(id)
            .iter()
            .filter(|d| d.kind == ImportKind::Sync)
            .map(|d| d.to)
    }

    /// All edges of a given kind
    pub fn edges_of_kind(&self, kind: ImportKind) -> impl Iterator<Item = &Dependency> {
        self.edges.iter().flatten().filter(move |d| d.kind == kind)
    }

    /// Modules reachable from `start` through synchronous edges (BFS)
    pub fn sync_closure(&self, start: ModuleId) -> Vec<ModuleId> {
        self.reachable(start, |d| d.kind == ImportKind::Sync)
    }

    /// Modules reachable from `start` through any edge (BFS)
    pub fn get_reachable_modules(&self, start: ModuleId) -> Vec<ModuleId> {
        self.reachable(start, |_| true)
    }

    fn reachable(&self, start: ModuleId, follow: impl Fn(&Dependency) -> bool) -> Vec<ModuleId> {
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::new();

        queue.push_back(start);
        visited.insert(start);

        while let Some(id) = queue.pop_front() {
            result.push(id);

            for dep in self.dependencies(id) {
                if follow(dep) && visited.insert(dep.to) {
                    queue.push_back(dep.to);
                }
            }
        }

        result
    }

    /// Number of distinct modules importing `id` synchronously
    pub fn sync_importer_count(&self, id: ModuleId) -> usize {
        self.edges
            .iter()
            .filter(|deps| deps.iter().any(|d| d.to == id && d.kind == ImportKind::Sync))
            .count()
    }

    /// Fail with the first synchronous cycle found, if any
    ///
    /// Deferred edges are ignored, so cycles closed by a deferred import are
    /// allowed. The reported path starts and ends with the same module.
    pub fn check_cycles(&self) -> Result<(), BuildError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let adjacency = self.sync_adjacency();
        let mut marks = vec![Mark::New; self.modules.len()];
        let mut stack: Vec<ModuleId> = Vec::new();

        for root in 0..self.modules.len() {
            if marks[root] != Mark::New {
                continue;
            }

            // Iterative DFS: (module, index of next edge to visit)
            let mut frames: Vec<(ModuleId, usize)> = vec![(root, 0)];
            marks[root] = Mark::Active;
            stack.push(root);

            while let Some(frame) = frames.last_mut() {
                let (id, next) = *frame;
                let sync_edges = &adjacency[id];

                if next >= sync_edges.len() {
                    marks[id] = Mark::Done;
                    stack.pop();
                    frames.pop();
                    continue;
                }

                frame.1 += 1;
                let to = sync_edges[next];

                match marks[to] {
                    Mark::New => {
                        marks[to] = Mark::Active;
                        stack.push(to);
                        frames.push((to, 0));
                    }
                    Mark::Active => {
                        let start = stack.iter().position(|&m| m == to).unwrap_or(0);
                        let mut cycle: Vec<PathBuf> = stack[start..]
                            .iter()
                            .map(|&m| self.modules[m].path.clone())
                            .collect();
                        cycle.push(self.modules[to].path.clone());
                        return Err(BuildError::CyclicDependency { cycle });
                    }
                    Mark::Done => {}
                }
            }
        }

        Ok(())
    }

    /// Rank of each module in a depth-first post-order over synchronous
    /// edges, starting from the entries in declaration order
    ///
    /// Sorting by rank puts every dependency before its importers, which is
    /// the order stylesheets must be concatenated in.
    pub fn post_order_ranks(&self) -> Vec<usize> {
        let adjacency = self.sync_adjacency();
        let mut ranks = vec![usize::MAX; self.modules.len()];
        let mut visited = vec![false; self.modules.len()];
        let mut next_rank = 0;

        let roots = self
            .entries
            .iter()
            .map(|(_, id)| *id)
            .chain(0..self.modules.len());

        for root in roots {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut frames: Vec<(ModuleId, usize)> = vec![(root, 0)];

            while let Some(frame) = frames.last_mut() {
                let (id, next) = *frame;
                let to = adjacency[id].get(next).copied();
                frame.1 += 1;

                match to {
                    Some(to) if !visited[to] => {
                        visited[to] = true;
                        frames.push((to, 0));
                    }
                    Some(_) => {}
                    None => {
                        ranks[id] = next_rank;
                        next_rank += 1;
                        frames.pop();
                    }
                }
            }
        }

        ranks
    }

    /// Synchronous successors of every module, indexed by module ID
    fn sync_adjacency(&self) -> Vec<Vec<ModuleId>> {
        (0..self.modules.len())
            .map(|id| self.sync_dependencies(id).collect())
            .collect()
    }

    /// Total number of modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check if graph is empty
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn module(path: &str) -> Module {
        Module {
            path: PathBuf::from(path),
            key: path.trim_start_matches('/').to_string(),
            content_type: ContentType::from_path(Path::new(path)),
            source: Vec::new(),
            transformed: String::new(),
            imports: Vec::new(),
            assets: Vec::new(),
            files: Vec::new(),
            entry: None,
        }
    }

    pub(crate) fn edge(from: ModuleId, to: ModuleId, kind: ImportKind) -> Dependency {
        Dependency {
            from,
            to,
            kind,
            specifier: format!("./{}", to),
        }
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(ContentType::from_extension("js"), ContentType::JavaScript);
        assert_eq!(ContentType::from_extension("ts"), ContentType::TypeScript);
        assert_eq!(ContentType::from_extension("jsx"), ContentType::Jsx);
        assert_eq!(ContentType::from_extension("tsx"), ContentType::Tsx);
        assert_eq!(ContentType::from_extension("css"), ContentType::Css);
        assert_eq!(ContentType::from_extension("LESS"), ContentType::Less);
        assert_eq!(ContentType::from_extension("json"), ContentType::Json);
        assert_eq!(
            ContentType::from_extension("svg"),
            ContentType::Other("svg".to_string())
        );
        assert_eq!(ContentType::from_extension("svg").as_str(), "svg");
    }

    #[test]
    fn test_module_graph_basic() {
        let mut graph = ModuleGraph::new();

        let id = graph.add_module(module("/test/main.js"));
        assert_eq!(graph.len(), 1);
        assert!(graph.get_module(id).is_some());
        assert_eq!(graph.get_module_id(Path::new("/test/main.js")), Some(id));

        // Same identity is never added twice
        assert_eq!(graph.add_module(module("/test/main.js")), id);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_sync_closure_skips_deferred_edges() {
        let mut graph = ModuleGraph::new();
        let a = graph.add_module(module("/a.js"));
        let b = graph.add_module(module("/b.js"));
        let c = graph.add_module(module("/c.js"));
        graph.add_dependency(edge(a, b, ImportKind::Sync));
        graph.add_dependency(edge(a, c, ImportKind::Deferred));

        assert_eq!(graph.sync_closure(a), vec![a, b]);
        assert_eq!(graph.get_reachable_modules(a), vec![a, b, c]);
    }

    #[test]
    fn test_sync_cycle_is_reported_with_path() {
        let mut graph = ModuleGraph::new();
        let a = graph.add_module(module("/a.js"));
        let b = graph.add_module(module("/b.js"));
        graph.add_dependency(edge(a, b, ImportKind::Sync));
        graph.add_dependency(edge(b, a, ImportKind::Sync));

        match graph.check_cycles() {
            Err(BuildError::CyclicDependency { cycle }) => {
                assert_eq!(
                    cycle,
                    vec![PathBuf::from("/a.js"), PathBuf::from("/b.js"), PathBuf::from("/a.js")]
                );
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_deferred_back_edge_is_allowed() {
        let mut graph = ModuleGraph::new();
        let a = graph.add_module(module("/a.js"));
        let b = graph.add_module(module("/b.js"));
        graph.add_dependency(edge(a, b, ImportKind::Sync));
        graph.add_dependency(edge(b, a, ImportKind::Deferred));

        assert!(graph.check_cycles().is_ok());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(module("/index.js"));
        let a = graph.add_module(module("/a.js"));
        let b = graph.add_module(module("/b.js"));
        let shared = graph.add_module(module("/shared.js"));
        graph.add_dependency(edge(index, a, ImportKind::Sync));
        graph.add_dependency(edge(index, b, ImportKind::Sync));
        graph.add_dependency(edge(a, shared, ImportKind::Sync));
        graph.add_dependency(edge(b, shared, ImportKind::Sync));

        assert!(graph.check_cycles().is_ok());
        assert_eq!(graph.sync_importer_count(shared), 2);
        assert_eq!(graph.sync_closure(index).len(), 4);
    }

    #[test]
    fn test_post_order_puts_dependencies_first() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(module("/index.js"));
        let a = graph.add_module(module("/a.js"));
        let b = graph.add_module(module("/b.js"));
        let shared = graph.add_module(module("/shared.js"));
        graph.add_dependency(edge(index, a, ImportKind::Sync));
        graph.add_dependency(edge(index, b, ImportKind::Sync));
        graph.add_dependency(edge(a, shared, ImportKind::Sync));
        graph.add_dependency(edge(b, shared, ImportKind::Sync));
        graph.add_entry("main".into(), index);

        let ranks = graph.post_order_ranks();
        assert_eq!(ranks[shared], 0);
        assert_eq!(ranks[a], 1);
        assert_eq!(ranks[b], 2);
        assert_eq!(ranks[index], 3);
    }

    #[test]
    fn test_wide_fan_out_ranks_and_late_cycle() {
        let mut graph = ModuleGraph::new();
        let hub = graph.add_module(module("/hub.js"));
        let leaves: Vec<_> = (0..200)
            .map(|i| graph.add_module(module(&format!("/leaf{}.js", i))))
            .collect();
        for &leaf in &leaves {
            graph.add_dependency(edge(hub, leaf, ImportKind::Sync));
        }
        graph.add_entry("main".into(), hub);

        let ranks = graph.post_order_ranks();
        assert_eq!(ranks[leaves[0]], 0);
        assert_eq!(ranks[leaves[199]], 199);
        assert_eq!(ranks[hub], 200);
        assert!(graph.check_cycles().is_ok());

        // only the last leaf points back
        graph.add_dependency(edge(leaves[199], hub, ImportKind::Sync));
        match graph.check_cycles() {
            Err(BuildError::CyclicDependency { cycle }) => {
                assert_eq!(
                    cycle,
                    vec![PathBuf::from("/hub.js"), PathBuf::from("/leaf199.js"), PathBuf::from("/hub.js")]
                );
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }
}
