//! Core bundler implementation
//!
//! Builds the module graph, plans chunks and emits content-hashed bundles.

mod builder;
mod chunk;
mod emit;
mod graph;
mod optimize;
mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::BuildOptions;
use crate::config::Config;
use crate::error::BuildFailure;
use crate::resolver::Resolver;
use crate::transform::{TransformRegistry, TransformStage};

pub use builder::GraphBuilder;
pub use chunk::{Chunk, ChunkGraph, ChunkId, ChunkKind, ChunkPlanner};
pub use emit::{Emission, Emitter, Manifest, ManifestEntry, OutputFile, MANIFEST_FILE};
pub use graph::{
    AuxAsset, ContentType, Dependency, EmittedFile, ImportKind, ImportRef, Module, ModuleGraph,
    ModuleId,
};
pub use optimize::{AssetKind, BasicOptimizer, Optimizer};

/// Result of a build operation
#[derive(Debug)]
pub struct BuildResult {
    /// Generated bundles
    pub bundles: Vec<BundleInfo>,

    /// Files copied from modules, such as images
    pub assets: Vec<AssetInfo>,

    /// Entry name -> ordered scripts and styles
    pub manifest: Manifest,

    /// Number of modules in the graph
    pub modules: usize,

    /// Elapsed wall time
    pub duration: Duration,
}

/// Information about a generated bundle
#[derive(Debug)]
pub struct BundleInfo {
    /// Output file path
    pub output_path: PathBuf,

    /// Chunk the file was emitted for
    pub chunk: String,

    pub kind: ChunkKind,

    /// Bundle size in bytes
    pub size: usize,
}

/// A file copied into the output directory
#[derive(Debug)]
pub struct AssetInfo {
    pub output_path: PathBuf,
    pub size: usize,
}

/// The main bundler
///
/// Holds the per-build configuration and the shared, read-only stage and
/// resolver state. Every call to [`Bundler::build`] is an independent build.
pub struct Bundler {
    /// Project configuration, with command-line overrides applied
    config: Arc<Config>,

    /// Module resolver
    resolver: Arc<Resolver>,

    /// Transform stages and rules
    registry: Arc<TransformRegistry>,

    /// Chunk planner
    planner: ChunkPlanner,

    /// Optimizer delegate
    optimizer: Box<dyn Optimizer>,
}

impl Bundler {
    /// Create a new bundler instance
    pub fn new(config: Config, options: BuildOptions) -> Result<Self> {
        Self::with_stages(config, options, Vec::new())
    }

    /// Create a bundler with additional transform stages available to rules
    pub fn with_stages(
        mut config: Config,
        options: BuildOptions,
        stages: Vec<Arc<dyn TransformStage>>,
    ) -> Result<Self> {
        options.apply(&mut config);
        config.validate()?;

        let registry = TransformRegistry::with_stages(&config, stages)?;
        let planner = ChunkPlanner::new(&config)?;
        let optimizer = optimize::builtin(&config.optimizer.minifier)
            .with_context(|| format!("Unknown optimizer '{}'", config.optimizer.minifier))?;

        Ok(Self {
            resolver: Arc::new(Resolver::new(&config)),
            registry: Arc::new(registry),
            planner,
            optimizer,
            config: Arc::new(config),
        })
    }

    /// Replace the optimizer delegate
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Effective configuration for this bundler
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the module graph from the configured entries
    pub async fn build_graph(&self) -> Result<ModuleGraph, BuildFailure> {
        let entries: Vec<(String, String)> = self
            .config
            .entries
            .iter()
            .map(|(name, reference)| (name.clone(), reference.clone()))
            .collect();

        let builder = GraphBuilder::new(
            self.config.root.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.registry),
            self.config.workers(),
            Duration::from_millis(self.config.build.timeout_ms),
        );

        builder.build(&entries).await
    }

    /// Build the module graph and plan its chunks without emitting anything
    pub async fn plan(&self) -> Result<(ModuleGraph, ChunkGraph), BuildFailure> {
        info!("Building module graph...");
        let graph = self.build_graph().await?;

        info!("Planning chunks for {} module(s)...", graph.len());
        let chunks = self.planner.plan(&graph);

        Ok((graph, chunks))
    }

    /// Build the project
    ///
    /// Nothing is written until the graph is complete and every chunk has
    /// been linked, optimized and hashed.
    pub async fn build(&self) -> Result<BuildResult, BuildFailure> {
        let start = Instant::now();

        let (graph, chunks) = self.plan().await?;

        info!("Emitting {} chunk(s)...", chunks.chunks().len());
        let optimizer = self
            .config
            .optimize_enabled()
            .then_some(self.optimizer.as_ref());
        let emission = Emitter::new(&self.config, &graph, &chunks, optimizer).render()?;

        let out_dir = self.config.output_dir();
        emission.write(&out_dir, self.config.output.clean)?;

        let bundles = emission
            .files
            .iter()
            .map(|file| BundleInfo {
                output_path: out_dir.join(&file.filename),
                chunk: file.chunk.clone(),
                kind: file.kind,
                size: file.contents.len(),
            })
            .collect();

        let assets = emission
            .assets
            .iter()
            .map(|file| AssetInfo {
                output_path: out_dir.join(&file.filename),
                size: file.contents.len(),
            })
            .collect();

        let duration = start.elapsed();
        debug!("Build completed in {:?}", duration);

        Ok(BuildResult {
            bundles,
            assets,
            manifest: emission.manifest,
            modules: graph.len(),
            duration,
        })
    }
}
