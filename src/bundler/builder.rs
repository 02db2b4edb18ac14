//! Concurrent module graph construction
//!
//! Each discovered module is processed on the blocking pool (read, transform,
//! resolve its references), bounded by a semaphore of `workers` permits and a
//! per-module timeout. A shared visited set guarantees every identity is
//! processed at most once. Once every task has reported, the graph is rebuilt
//! in a deterministic breadth-first order from the entries so the result does
//! not depend on task completion order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, warn};

use super::graph::{AuxAsset, ContentType, Dependency, EmittedFile, ImportRef, Module, ModuleGraph};
use crate::error::{BuildError, BuildFailure};
use crate::resolver::{ResolvedModule, Resolver};
use crate::transform::TransformRegistry;
use crate::utils::{module_digest, panic_message, unique_keys};

/// A module after its pipeline ran and its references were resolved
#[derive(Debug)]
struct Processed {
    path: PathBuf,
    content_type: ContentType,
    source: Vec<u8>,
    code: String,
    imports: Vec<ImportRef>,
    assets: Vec<AuxAsset>,
    files: Vec<EmittedFile>,

    /// Target of each import, `None` where resolution failed
    targets: Vec<Option<PathBuf>>,
}

/// Outcome of one worker task
#[derive(Debug)]
struct Outcome {
    processed: Option<Processed>,
    errors: Vec<BuildError>,

    /// Identities first seen by this task, to be scheduled next
    discovered: Vec<ResolvedModule>,
}

/// Identities already claimed by some task
#[derive(Debug, Default)]
struct VisitedSet {
    paths: Mutex<HashSet<PathBuf>>,
}

impl VisitedSet {
    /// Returns true if `path` was not claimed before
    fn claim(&self, path: &Path) -> bool {
        self.paths.lock().insert(path.to_path_buf())
    }
}

/// Builds the module graph from the configured entries
pub struct GraphBuilder {
    root: PathBuf,
    resolver: Arc<Resolver>,
    registry: Arc<TransformRegistry>,
    workers: usize,
    timeout: Duration,
}

impl GraphBuilder {
    pub fn new(
        root: PathBuf,
        resolver: Arc<Resolver>,
        registry: Arc<TransformRegistry>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            root,
            resolver,
            registry,
            workers: workers.max(1),
            timeout,
        }
    }

    /// Discover, transform and link every module reachable from `entries`
    ///
    /// Resolution, transform and timeout errors are collected across all
    /// modules; the build fails after the barrier with all of them. A
    /// synchronous cycle fails the build on its own.
    pub async fn build(&self, entries: &[(String, String)]) -> Result<ModuleGraph, BuildFailure> {
        let visited = Arc::new(VisitedSet::default());
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<task::Id, PathBuf> = HashMap::new();
        let mut errors = Vec::new();
        let mut entry_paths = Vec::new();

        for (name, specifier) in entries {
            match self.resolver.resolve(specifier, None) {
                Ok(resolved) => {
                    debug!("Entry '{}' -> {}", name, resolved.path.display());
                    entry_paths.push((name.clone(), resolved.path.clone()));
                    if visited.claim(&resolved.path) {
                        let path = resolved.path.clone();
                        let id = self.spawn(&mut tasks, resolved, &visited, &semaphore);
                        pending.insert(id, path);
                    }
                }
                Err(source) => errors.push(BuildError::Resolution {
                    importer: None,
                    source,
                }),
            }
        }

        let mut processed: HashMap<PathBuf, Processed> = HashMap::new();

        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    outcome
                }
                Err(e) => {
                    let path = pending.remove(&e.id()).unwrap_or_default();
                    if !e.is_panic() {
                        warn!("Module task for {} cancelled: {}", path.display(), e);
                        continue;
                    }
                    Outcome::failed(crashed(path, e))
                }
            };

            errors.extend(outcome.errors);
            for module in outcome.discovered {
                let path = module.path.clone();
                let id = self.spawn(&mut tasks, module, &visited, &semaphore);
                pending.insert(id, path);
            }
            if let Some(module) = outcome.processed {
                processed.insert(module.path.clone(), module);
            }
        }

        if !errors.is_empty() {
            errors.sort_by_cached_key(|e| {
                let record = e.to_record();
                (record.module, record.stage, record.message)
            });
            return Err(BuildFailure::new(errors));
        }

        let graph = self.assemble(&entry_paths, processed);
        graph.check_cycles()?;

        debug!("Module graph complete: {} modules", graph.len());
        Ok(graph)
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<Outcome>,
        module: ResolvedModule,
        visited: &Arc<VisitedSet>,
        semaphore: &Arc<Semaphore>,
    ) -> task::Id {
        let resolver = Arc::clone(&self.resolver);
        let registry = Arc::clone(&self.registry);
        let visited = Arc::clone(visited);
        let semaphore = Arc::clone(semaphore);
        let timeout = self.timeout;

        tasks.spawn(async move {
            // Permits are never closed while tasks are pending
            let _permit = semaphore.acquire_owned().await.ok();
            let path = module.path.clone();

            let work = task::spawn_blocking(move || {
                process_module(module, &resolver, &registry, &visited)
            });

            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => Outcome::failed(crashed(path, e)),
                Err(_) => Outcome::failed(BuildError::Timeout {
                    module: path,
                    stage: "transform".to_string(),
                }),
            }
        })
        .id()
    }

    /// Number modules breadth-first from the entries in declaration order,
    /// following imports in source order
    fn assemble(
        &self,
        entry_paths: &[(String, PathBuf)],
        mut processed: HashMap<PathBuf, Processed>,
    ) -> ModuleGraph {
        let mut order: Vec<Processed> = Vec::with_capacity(processed.len());
        let mut queue: VecDeque<PathBuf> = entry_paths.iter().map(|(_, p)| p.clone()).collect();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        while let Some(path) = queue.pop_front() {
            if !seen.insert(path.clone()) {
                continue;
            }
            let Some(module) = processed.remove(&path) else {
                continue;
            };
            for target in module.targets.iter().flatten() {
                if !seen.contains(target) {
                    queue.push_back(target.clone());
                }
            }
            order.push(module);
        }

        let digests: Vec<String> = order
            .iter()
            .map(|module| module_digest(&self.root, &module.path))
            .collect();
        let keys = unique_keys(&digests);

        let mut graph = ModuleGraph::new();
        let mut pending_edges = Vec::new();

        for (module, key) in order.into_iter().zip(keys) {
            let id = graph.add_module(Module {
                key,
                path: module.path,
                content_type: module.content_type,
                source: module.source,
                transformed: module.code,
                imports: module.imports.clone(),
                assets: module.assets,
                files: module.files,
                entry: None,
            });
            pending_edges.push((id, module.imports, module.targets));
        }

        for (from, imports, targets) in pending_edges {
            for (import, target) in imports.into_iter().zip(targets) {
                let Some(to) = target.and_then(|t| graph.get_module_id(&t)) else {
                    continue;
                };
                graph.add_dependency(Dependency {
                    from,
                    to,
                    kind: import.kind,
                    specifier: import.specifier,
                });
            }
        }

        for (name, path) in entry_paths {
            if let Some(id) = graph.get_module_id(path) {
                graph.add_entry(name.clone(), id);
            }
        }

        graph
    }
}

/// A module task that panicked or was cancelled
fn crashed(module: PathBuf, error: task::JoinError) -> BuildError {
    let message = match error.try_into_panic() {
        Ok(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        Err(error) => error.to_string(),
    };

    BuildError::Transform {
        module,
        stage: "transform".to_string(),
        message,
    }
}

impl Outcome {
    fn failed(error: BuildError) -> Self {
        Self {
            processed: None,
            errors: vec![error],
            discovered: Vec::new(),
        }
    }
}

/// Read, transform and resolve a single module; runs on the blocking pool
fn process_module(
    module: ResolvedModule,
    resolver: &Resolver,
    registry: &TransformRegistry,
    visited: &VisitedSet,
) -> Outcome {
    let ResolvedModule { path, content_type } = module;
    debug!("Processing {}", path.display());

    let source = match fs::read(&path) {
        Ok(source) => source,
        Err(e) => {
            return Outcome::failed(BuildError::Transform {
                module: path,
                stage: "load".to_string(),
                message: e.to_string(),
            })
        }
    };

    let transformed = match registry.run(&source, &path, &content_type) {
        Ok(transformed) => transformed,
        Err(e) => return Outcome::failed(e),
    };

    let mut errors = Vec::new();
    let mut discovered = Vec::new();
    let mut targets = Vec::with_capacity(transformed.imports.len());

    for import in &transformed.imports {
        match resolver.resolve(&import.specifier, Some(&path)) {
            Ok(resolved) => {
                targets.push(Some(resolved.path.clone()));
                if visited.claim(&resolved.path) {
                    discovered.push(resolved);
                }
            }
            Err(source) => {
                targets.push(None);
                errors.push(BuildError::Resolution {
                    importer: Some(path.clone()),
                    source,
                });
            }
        }
    }

    Outcome {
        processed: Some(Processed {
            path,
            content_type,
            source,
            code: transformed.code,
            imports: transformed.imports,
            assets: transformed.assets,
            files: transformed.files,
            targets,
        }),
        errors,
        discovered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::ImportKind;
    use crate::config::Config;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn builder(root: &Path, workers: usize) -> (GraphBuilder, Vec<(String, String)>) {
        let config = Config::default_config(fs::canonicalize(root).unwrap());
        let resolver = Arc::new(Resolver::new(&config));
        let registry = Arc::new(TransformRegistry::new(&config).unwrap());
        let entries = config
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (
            GraphBuilder::new(
                config.root.clone(),
                resolver,
                registry,
                workers,
                Duration::from_secs(10),
            ),
            entries,
        )
    }

    fn names(graph: &ModuleGraph) -> Vec<String> {
        graph
            .modules()
            .map(|(_, m)| m.path.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_graph_order_is_breadth_first_in_import_order() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/index.js", "require('./a');\nrequire('./b');\n");
        write(tmp.path(), "src/a.js", "require('./shared');\n");
        write(tmp.path(), "src/b.js", "require('./shared');\nimport('./lazy');\n");
        write(tmp.path(), "src/shared.js", "module.exports = 1;\n");
        write(tmp.path(), "src/lazy.js", "module.exports = 2;\n");

        for workers in [1, 4] {
            let (builder, entries) = builder(tmp.path(), workers);
            let graph = builder.build(&entries).await.unwrap();

            assert_eq!(
                names(&graph),
                vec!["index.js", "a.js", "b.js", "shared.js", "lazy.js"]
            );
            assert_eq!(graph.entries()[0], ("main".to_string(), 0));
            assert_eq!(graph.edges_of_kind(ImportKind::Deferred).count(), 1);
            assert_eq!(graph.sync_importer_count(3), 2);
        }
    }

    #[tokio::test]
    async fn test_errors_are_aggregated_across_modules() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/index.js", "require('./a');\nrequire('./missing-one');\n");
        write(tmp.path(), "src/a.js", "require('./missing-two');\n");

        let (builder, entries) = builder(tmp.path(), 2);
        let failure = builder.build(&entries).await.unwrap_err();

        assert_eq!(failure.errors.len(), 2);
        let text = failure.to_string();
        assert!(text.contains("missing-one"));
        assert!(text.contains("missing-two"));
    }

    #[tokio::test]
    async fn test_sync_cycle_fails_the_build() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/index.js", "require('./a');\n");
        write(tmp.path(), "src/a.js", "require('./b');\n");
        write(tmp.path(), "src/b.js", "require('./a');\n");

        let (builder, entries) = builder(tmp.path(), 2);
        let failure = builder.build(&entries).await.unwrap_err();

        assert!(matches!(
            failure.errors.as_slice(),
            [BuildError::CyclicDependency { cycle }] if cycle.len() == 3
        ));
    }

    #[tokio::test]
    async fn test_each_identity_is_processed_once() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "src/index.js",
            "require('./shared');\nrequire('./shared.js');\nrequire('./other');\n",
        );
        write(tmp.path(), "src/other.js", "require('./shared');\n");
        write(tmp.path(), "src/shared.js", "");

        let (builder, entries) = builder(tmp.path(), 4);
        let graph = builder.build(&entries).await.unwrap();

        assert_eq!(graph.len(), 3);
        let targets: Vec<_> = graph.dependencies(0).iter().map(|d| d.to).collect();
        assert_eq!(targets, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_colliding_module_keys_are_lengthened() {
        // both root-relative paths hash to 8ce6dece...
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/index.js", "require('./m39592');\nrequire('./m64811');\n");
        write(tmp.path(), "src/m39592.js", "module.exports = 1;\n");
        write(tmp.path(), "src/m64811.js", "module.exports = 2;\n");

        let (builder, entries) = builder(tmp.path(), 2);
        let graph = builder.build(&entries).await.unwrap();
        let keys: Vec<&str> = graph.modules().map(|(_, m)| m.key.as_str()).collect();

        assert_eq!(keys[0].len(), 8);
        assert!(keys[1].starts_with("8ce6dece"));
        assert!(keys[2].starts_with("8ce6dece"));
        assert!(keys[1].len() > 8);
        assert_ne!(keys[1], keys[2]);
    }
}
