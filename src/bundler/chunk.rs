//! Chunk planning for code splitting
//!
//! Every module reachable from an entry is assigned to at least one chunk:
//!
//! 1. Each entry and each deferred import target is a chunk root. An async
//!    root's closure excludes modules already loaded by every entry that
//!    reaches it.
//! 2. Non-entry modules matching a cache-group rule move to that group's
//!    chunk. Rules apply in priority order, then declaration order.
//! 3. Remaining modules shared by several roots, or imported by at least
//!    `split.min_refs` modules, move to the shared chunk.
//! 4. Everything else stays with its root. With splitting disabled, a module
//!    reachable from several roots is duplicated into each of them.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::graph::{ImportKind, ModuleGraph, ModuleId};
use crate::config::{Config, SplitConfig};
use crate::utils::normalize_path;

/// Index of a chunk in the chunk graph, in creation order
pub type ChunkId = usize;

/// Type of chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Entry point chunk - loaded immediately
    Entry,
    /// Async chunk - loaded on demand via deferred import
    Async,
    /// Cache-group chunk - modules selected by a configured rule
    CacheGroup,
    /// Shared chunk - modules used by several roots
    Shared,
    /// Module loader, always loaded first
    Runtime,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Entry => "entry",
            ChunkKind::Async => "async",
            ChunkKind::CacheGroup => "cache-group",
            ChunkKind::Shared => "shared",
            ChunkKind::Runtime => "runtime",
        }
    }

    /// Whether the chunk executes a root module when loaded
    pub fn is_root(&self) -> bool {
        matches!(self, ChunkKind::Entry | ChunkKind::Async)
    }
}

/// A chunk is a group of modules that will be bundled together
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk name (used for output filename)
    pub name: String,

    /// Type of chunk
    pub kind: ChunkKind,

    /// Module IDs included in this chunk, dependencies first
    pub modules: Vec<ModuleId>,

    /// Chunks that must be loaded before this one
    pub deps: Vec<ChunkId>,

    /// Entry module or deferred import target for root chunks
    pub root: Option<ModuleId>,
}

impl Chunk {
    /// Number of modules in chunk
    pub fn len(&self) -> usize {
        self.modules.len()
    }
}

/// The planned set of chunks and their load relations
#[derive(Debug, Clone)]
pub struct ChunkGraph {
    chunks: Vec<Chunk>,

    /// Chunks holding each module
    module_chunks: HashMap<ModuleId, Vec<ChunkId>>,

    /// Deferred import target -> async chunk; absent when the target is
    /// always available already
    async_chunks: HashMap<ModuleId, ChunkId>,

    /// Position of each chunk in the global load order
    load_rank: Vec<usize>,

    runtime: ChunkId,
}

impl ChunkGraph {
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id]
    }

    pub fn runtime(&self) -> ChunkId {
        self.runtime
    }

    /// Entry chunks in declaration order
    pub fn entry_chunks(&self) -> impl Iterator<Item = (ChunkId, &Chunk)> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ChunkKind::Entry)
    }

    /// Chunks a module was placed in
    pub fn chunks_of(&self, module: ModuleId) -> &[ChunkId] {
        self.module_chunks
            .get(&module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Async chunk loaded for a deferred import of `module`
    pub fn async_chunk_for(&self, module: ModuleId) -> Option<ChunkId> {
        self.async_chunks.get(&module).copied()
    }

    /// Every chunk that must be loaded before `id`, in load order
    pub fn required_chunks(&self, id: ChunkId) -> Vec<ChunkId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ChunkId> = self.chunks[id].deps.clone();

        while let Some(dep) = stack.pop() {
            if dep != id && seen.insert(dep) {
                stack.extend(self.chunks[dep].deps.iter().copied());
            }
        }

        let mut required: Vec<ChunkId> = seen.into_iter().collect();
        required.sort_by_key(|&c| self.load_rank[c]);
        required
    }

    /// Full load order for an entry chunk: runtime, dependencies, entry
    pub fn load_order(&self, id: ChunkId) -> Vec<ChunkId> {
        let mut order = vec![self.runtime];
        order.extend(self.required_chunks(id));
        order.push(id);
        order
    }
}

/// A compiled cache-group rule
#[derive(Debug, Clone)]
struct CacheGroup {
    name: String,
    test: Regex,
}

/// Partitions a module graph into chunks
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    /// Rules sorted by priority (highest first), ties in declaration order
    groups: Vec<CacheGroup>,

    split: SplitConfig,
}

/// A chunk root before modules are assigned
struct Root {
    name: String,
    kind: ChunkKind,
    module: ModuleId,
    closure: Vec<ModuleId>,
}

/// Where a module ends up
enum Placement {
    Group(usize),
    Shared,
    Roots,
}

impl ChunkPlanner {
    pub fn new(config: &Config) -> Result<Self> {
        let mut groups = config
            .cache_groups
            .iter()
            .map(|group| {
                let test = Regex::new(&group.test).with_context(|| {
                    format!("Invalid test pattern in cache group '{}'", group.name)
                })?;
                Ok((group.priority, CacheGroup {
                    name: group.name.clone(),
                    test,
                }))
            })
            .collect::<Result<Vec<_>>>()?;

        // Stable sort keeps declaration order among equal priorities
        groups.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(Self {
            groups: groups.into_iter().map(|(_, g)| g).collect(),
            split: config.split.clone(),
        })
    }

    /// Plan chunks for a complete module graph
    pub fn plan(&self, graph: &ModuleGraph) -> ChunkGraph {
        let mut names = NameAllocator::default();
        let roots = self.roots(graph, &mut names);
        let ranks = graph.post_order_ranks();

        // owners[m] = indices of roots whose closure contains m
        let mut owners: HashMap<ModuleId, Vec<usize>> = HashMap::new();
        for (index, root) in roots.iter().enumerate() {
            for &module in &root.closure {
                owners.entry(module).or_default().push(index);
            }
        }

        let mut chunks: Vec<Chunk> = roots
            .iter()
            .map(|root| Chunk {
                name: root.name.clone(),
                kind: root.kind,
                modules: Vec::new(),
                deps: Vec::new(),
                root: Some(root.module),
            })
            .collect();

        let mut group_chunks: HashMap<String, ChunkId> = HashMap::new();
        let mut group_members: Vec<Vec<ModuleId>> = vec![Vec::new(); self.groups.len()];
        let mut shared_members: Vec<ModuleId> = Vec::new();
        let mut module_chunks: HashMap<ModuleId, Vec<ChunkId>> = HashMap::new();

        let root_modules: HashSet<ModuleId> = roots.iter().map(|r| r.module).collect();
        let mut assigned: Vec<ModuleId> = owners.keys().copied().collect();
        assigned.sort_unstable();

        for module in assigned {
            let module_owners = &owners[&module];
            let is_root = root_modules.contains(&module);
            match self.placement(graph, module, is_root, module_owners) {
                Placement::Group(index) => group_members[index].push(module),
                Placement::Shared => shared_members.push(module),
                Placement::Roots => {
                    for &root in module_owners {
                        chunks[root].modules.push(module);
                        module_chunks.entry(module).or_default().push(root);
                    }
                }
            }
        }

        for (index, members) in group_members.into_iter().enumerate() {
            if members.is_empty() {
                continue;
            }
            let name = &self.groups[index].name;
            let id = *group_chunks.entry(name.clone()).or_insert_with(|| {
                chunks.push(Chunk {
                    name: names.claim(name),
                    kind: ChunkKind::CacheGroup,
                    modules: Vec::new(),
                    deps: Vec::new(),
                    root: None,
                });
                chunks.len() - 1
            });
            for module in members {
                chunks[id].modules.push(module);
                module_chunks.entry(module).or_default().push(id);
            }
        }

        if !shared_members.is_empty() {
            chunks.push(Chunk {
                name: names.claim(&self.split.name),
                kind: ChunkKind::Shared,
                modules: shared_members.clone(),
                deps: Vec::new(),
                root: None,
            });
            let id = chunks.len() - 1;
            for module in shared_members {
                module_chunks.entry(module).or_default().push(id);
            }
        }

        for chunk in &mut chunks {
            chunk.modules.sort_by_key(|&m| ranks[m]);
        }

        self.link(graph, &roots, &mut chunks, &module_chunks);

        chunks.push(Chunk {
            name: names.claim("runtime"),
            kind: ChunkKind::Runtime,
            modules: Vec::new(),
            deps: Vec::new(),
            root: None,
        });
        let runtime = chunks.len() - 1;

        let async_chunks = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ChunkKind::Async)
            .filter_map(|(id, c)| c.root.map(|m| (m, id)))
            .collect();

        let load_rank = load_ranks(&chunks);

        for chunk in &chunks {
            debug!(
                "Chunk '{}' ({}): {} module(s)",
                chunk.name,
                chunk.kind.as_str(),
                chunk.modules.len()
            );
        }

        ChunkGraph {
            chunks,
            module_chunks,
            async_chunks,
            load_rank,
            runtime,
        }
    }

    /// Entry roots in declaration order, then async roots in module order
    fn roots(&self, graph: &ModuleGraph, names: &mut NameAllocator) -> Vec<Root> {
        let mut roots: Vec<Root> = graph
            .entries()
            .iter()
            .map(|(name, id)| Root {
                name: names.claim(name),
                kind: ChunkKind::Entry,
                module: *id,
                closure: graph.sync_closure(*id),
            })
            .collect();

        let entry_reach: Vec<HashSet<ModuleId>> = graph
            .entries()
            .iter()
            .map(|(_, id)| graph.get_reachable_modules(*id).into_iter().collect())
            .collect();
        let entry_closures: Vec<HashSet<ModuleId>> = roots
            .iter()
            .map(|r| r.closure.iter().copied().collect())
            .collect();

        let mut targets: Vec<ModuleId> = graph
            .edges_of_kind(ImportKind::Deferred)
            .map(|d| d.to)
            .collect();
        targets.sort_unstable();
        targets.dedup();

        for target in targets {
            // Modules every reaching entry has already loaded synchronously
            let mut available: Option<HashSet<ModuleId>> = None;
            for (index, reach) in entry_reach.iter().enumerate() {
                if !reach.contains(&target) {
                    continue;
                }
                available = Some(match available {
                    None => entry_closures[index].clone(),
                    Some(set) => set.intersection(&entry_closures[index]).copied().collect(),
                });
            }
            let available = available.unwrap_or_default();

            let closure: Vec<ModuleId> = graph
                .sync_closure(target)
                .into_iter()
                .filter(|m| !available.contains(m))
                .collect();

            if closure.is_empty() {
                debug!("Deferred target {} is always available; no chunk", target);
                continue;
            }

            let stem = graph
                .get_module(target)
                .and_then(|m| m.path.file_stem())
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("chunk-{}", target));

            roots.push(Root {
                name: names.claim(&stem),
                kind: ChunkKind::Async,
                module: target,
                closure,
            });
        }

        roots
    }

    fn placement(
        &self,
        graph: &ModuleGraph,
        module: ModuleId,
        is_root: bool,
        owners: &[usize],
    ) -> Placement {
        let Some(info) = graph.get_module(module) else {
            return Placement::Roots;
        };

        if info.entry.is_none() {
            let path = normalize_path(&info.path);
            if let Some(index) = self.groups.iter().position(|g| g.test.is_match(&path)) {
                return Placement::Group(index);
            }
        }

        if !self.split.enabled {
            return Placement::Roots;
        }

        let widely_imported = self.split.min_refs > 0
            && graph.sync_importer_count(module) >= self.split.min_refs;

        if owners.len() > 1 || (!is_root && widely_imported) {
            Placement::Shared
        } else {
            Placement::Roots
        }
    }

    /// Record which chunks each chunk needs loaded first
    fn link(
        &self,
        graph: &ModuleGraph,
        roots: &[Root],
        chunks: &mut [Chunk],
        module_chunks: &HashMap<ModuleId, Vec<ChunkId>>,
    ) {
        fn holders(map: &HashMap<ModuleId, Vec<ChunkId>>, module: ModuleId) -> &[ChunkId] {
            map.get(&module).map(Vec::as_slice).unwrap_or(&[])
        }

        for (index, root) in roots.iter().enumerate() {
            let mut deps: Vec<ChunkId> = root
                .closure
                .iter()
                .flat_map(|&m| holders(module_chunks, m).iter().copied())
                .filter(|&c| c != index && !chunks[c].kind.is_root())
                .collect();
            deps.sort_unstable();
            deps.dedup();
            chunks[index].deps = deps;
        }

        for index in roots.len()..chunks.len() {
            let mut deps: Vec<ChunkId> = chunks[index]
                .modules
                .iter()
                .flat_map(|&m| graph.sync_dependencies(m).collect::<Vec<_>>())
                .flat_map(|m| holders(module_chunks, m).iter().copied())
                .filter(|&c| c != index && !chunks[c].kind.is_root())
                .collect();
            deps.sort_unstable();
            deps.dedup();
            chunks[index].deps = deps;
        }
    }
}

/// Topological rank of every chunk over its deps
///
/// Among ready chunks the earliest created goes first; a cycle between
/// non-root chunks is broken at its earliest created member.
fn load_ranks(chunks: &[Chunk]) -> Vec<usize> {
    let mut rank = vec![usize::MAX; chunks.len()];
    let mut next = 0;

    while next < chunks.len() {
        let ready = (0..chunks.len()).find(|&c| {
            rank[c] == usize::MAX
                && chunks[c]
                    .deps
                    .iter()
                    .all(|&d| d == c || rank[d] != usize::MAX)
        });
        let pick = ready.or_else(|| (0..chunks.len()).find(|&c| rank[c] == usize::MAX));

        match pick {
            Some(c) => {
                rank[c] = next;
                next += 1;
            }
            None => break,
        }
    }

    rank
}

/// Hands out unique, filename-safe chunk names
#[derive(Debug, Default)]
struct NameAllocator {
    used: HashSet<String>,
}

impl NameAllocator {
    fn claim(&mut self, wanted: &str) -> String {
        let base: String = wanted
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let base = if base.is_empty() { "chunk".to_string() } else { base };

        let mut name = base.clone();
        let mut n = 2;
        while !self.used.insert(name.clone()) {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::graph::tests::{edge, module};
    use crate::config::Config;

    fn planner(toml: &str) -> ChunkPlanner {
        let config = Config::from_toml(
            &format!("[entries]\nmain = \"./src/index\"\n{}", toml),
            "/p".into(),
        )
        .unwrap();
        ChunkPlanner::new(&config).unwrap()
    }

    fn chunk_named<'a>(chunks: &'a ChunkGraph, name: &str) -> &'a Chunk {
        chunks
            .chunks()
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no chunk named {}", name))
    }

    fn names(chunks: &ChunkGraph, ids: &[ChunkId]) -> Vec<String> {
        ids.iter().map(|&id| chunks.chunk(id).name.clone()).collect()
    }

    /// index -> a, b; a -> shared; b -> shared
    fn diamond() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(module("/p/src/index.js"));
        let a = graph.add_module(module("/p/src/a.js"));
        let b = graph.add_module(module("/p/src/b.js"));
        let shared = graph.add_module(module("/p/src/shared.js"));
        graph.add_dependency(edge(index, a, ImportKind::Sync));
        graph.add_dependency(edge(index, b, ImportKind::Sync));
        graph.add_dependency(edge(a, shared, ImportKind::Sync));
        graph.add_dependency(edge(b, shared, ImportKind::Sync));
        graph.add_entry("main".into(), index);
        graph
    }

    #[test]
    fn test_widely_imported_module_moves_to_common() {
        let graph = diamond();
        let chunks = planner("").plan(&graph);

        assert_eq!(chunk_named(&chunks, "main").modules, vec![1, 2, 0]);
        assert_eq!(chunk_named(&chunks, "common").modules, vec![3]);
        assert_eq!(chunk_named(&chunks, "common").kind, ChunkKind::Shared);

        let (main, _) = chunks.entry_chunks().next().unwrap();
        assert_eq!(
            names(&chunks, &chunks.load_order(main)),
            vec!["runtime", "common", "main"]
        );
    }

    #[test]
    fn test_every_module_is_placed() {
        let graph = diamond();
        let chunks = planner("").plan(&graph);
        for (id, _) in graph.modules() {
            assert!(!chunks.chunks_of(id).is_empty(), "module {} unplaced", id);
        }
    }

    #[test]
    fn test_cache_group_wins_over_shared() {
        let mut graph = ModuleGraph::new();
        let main = graph.add_module(module("/p/src/main.js"));
        let admin = graph.add_module(module("/p/src/admin.js"));
        let lib = graph.add_module(module("/p/node_modules/lib/index.js"));
        graph.add_dependency(edge(main, lib, ImportKind::Sync));
        graph.add_dependency(edge(admin, lib, ImportKind::Sync));
        graph.add_entry("main".into(), main);
        graph.add_entry("admin".into(), admin);

        let chunks = planner(
            "[[cache_groups]]\nname = \"vendor\"\ntest = \"node_modules\"\npriority = 10\n",
        )
        .plan(&graph);

        assert_eq!(chunk_named(&chunks, "vendor").modules, vec![lib]);
        assert!(chunks.chunks().iter().all(|c| c.kind != ChunkKind::Shared));
        for (id, _) in chunks.entry_chunks() {
            assert_eq!(
                names(&chunks, &chunks.load_order(id))[..2],
                ["runtime".to_string(), "vendor".to_string()]
            );
        }
    }

    #[test]
    fn test_higher_priority_group_wins() {
        let mut graph = ModuleGraph::new();
        let main = graph.add_module(module("/p/src/main.js"));
        let react = graph.add_module(module("/p/node_modules/react/index.js"));
        graph.add_dependency(edge(main, react, ImportKind::Sync));
        graph.add_entry("main".into(), main);

        let toml = "[[cache_groups]]\nname = \"vendor\"\ntest = \"node_modules\"\npriority = 1\n\
                    [[cache_groups]]\nname = \"react\"\ntest = \"node_modules/react\"\npriority = 5\n";
        let chunks = planner(toml).plan(&graph);

        assert_eq!(chunk_named(&chunks, "react").modules, vec![react]);
        assert!(chunks.chunks().iter().all(|c| c.name != "vendor"));
    }

    #[test]
    fn test_entry_module_ignores_cache_groups() {
        let mut graph = ModuleGraph::new();
        let main = graph.add_module(module("/p/node_modules/app/main.js"));
        graph.add_entry("main".into(), main);

        let chunks = planner("[[cache_groups]]\nname = \"vendor\"\ntest = \"node_modules\"\n")
            .plan(&graph);
        assert_eq!(chunk_named(&chunks, "main").modules, vec![main]);
    }

    #[test]
    fn test_deferred_target_gets_async_chunk() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(module("/p/src/index.js"));
        let util = graph.add_module(module("/p/src/util.js"));
        let page = graph.add_module(module("/p/src/page.js"));
        let widget = graph.add_module(module("/p/src/widget.js"));
        graph.add_dependency(edge(index, util, ImportKind::Sync));
        graph.add_dependency(edge(index, page, ImportKind::Deferred));
        graph.add_dependency(edge(page, util, ImportKind::Sync));
        graph.add_dependency(edge(page, widget, ImportKind::Sync));
        graph.add_entry("main".into(), index);

        let chunks = planner("[split]\nmin_refs = 0\n").plan(&graph);

        let async_id = chunks.async_chunk_for(page).unwrap();
        let async_chunk = chunks.chunk(async_id);
        assert_eq!(async_chunk.name, "page");
        // util is already loaded by the entry that reaches the boundary
        assert_eq!(async_chunk.modules, vec![widget, page]);
        assert_eq!(chunk_named(&chunks, "main").modules, vec![util, index]);
    }

    #[test]
    fn test_deferred_import_of_loaded_module_needs_no_chunk() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(module("/p/src/index.js"));
        let a = graph.add_module(module("/p/src/a.js"));
        graph.add_dependency(edge(index, a, ImportKind::Sync));
        graph.add_dependency(edge(a, index, ImportKind::Deferred));
        graph.add_entry("main".into(), index);

        let chunks = planner("").plan(&graph);
        assert!(chunks.async_chunk_for(index).is_none());
        assert!(chunks.chunks().iter().all(|c| c.kind != ChunkKind::Async));
    }

    #[test]
    fn test_split_disabled_duplicates_into_roots() {
        let mut graph = ModuleGraph::new();
        let main = graph.add_module(module("/p/src/main.js"));
        let admin = graph.add_module(module("/p/src/admin.js"));
        let util = graph.add_module(module("/p/src/util.js"));
        graph.add_dependency(edge(main, util, ImportKind::Sync));
        graph.add_dependency(edge(admin, util, ImportKind::Sync));
        graph.add_entry("main".into(), main);
        graph.add_entry("admin".into(), admin);

        let chunks = planner("[split]\nenabled = false\n").plan(&graph);

        assert_eq!(chunk_named(&chunks, "main").modules, vec![util, main]);
        assert_eq!(chunk_named(&chunks, "admin").modules, vec![util, admin]);
        assert_eq!(chunks.chunks_of(util).len(), 2);
    }

    #[test]
    fn test_chunk_names_are_unique() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(module("/p/src/index.js"));
        let first = graph.add_module(module("/p/src/a/view.js"));
        let second = graph.add_module(module("/p/src/b/view.js"));
        graph.add_dependency(edge(index, first, ImportKind::Deferred));
        graph.add_dependency(edge(index, second, ImportKind::Deferred));
        graph.add_entry("main".into(), index);

        let chunks = planner("").plan(&graph);
        assert_eq!(chunks.chunk(chunks.async_chunk_for(first).unwrap()).name, "view");
        assert_eq!(chunks.chunk(chunks.async_chunk_for(second).unwrap()).name, "view-2");
    }
}
