//! Artifact emission
//!
//! Links chunks, runs the optimizer, names files by content hash and writes
//! them. Every output is staged as a temporary file first; chunks, copied
//! files and HTML shells are moved into place before the manifest, so a
//! failed write never leaves a new manifest behind.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::chunk::{ChunkGraph, ChunkKind};
use super::graph::{EmittedFile, ModuleGraph};
use super::optimize::{AssetKind, Optimizer};
use super::runtime::{link_chunk, render_runtime, ChunkLocation};
use crate::config::{Config, Mode};
use crate::error::BuildError;
use crate::utils::hash_content;

pub const MANIFEST_FILE: &str = "manifest.json";

/// A finalized output file
#[derive(Debug, Clone)]
pub struct OutputFile {
    /// Chunk the file belongs to
    pub chunk: String,

    pub kind: ChunkKind,

    /// File name relative to the output directory
    pub filename: String,

    pub contents: String,
}

/// Files emitted for one chunk
#[derive(Debug, Clone, Default)]
pub struct ChunkFiles {
    pub script: Option<String>,

    /// Extension -> file name for auxiliary artifacts
    pub assets: BTreeMap<String, String>,
}

/// Scripts and styles an entry needs, dependencies first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub scripts: Vec<String>,
    pub styles: Vec<String>,
}

/// Entry name -> ordered files, in entry declaration order
pub type Manifest = IndexMap<String, ManifestEntry>;

/// Everything a build produces, before anything is written
#[derive(Debug, Clone)]
pub struct Emission {
    pub files: Vec<OutputFile>,

    /// Files copied from modules, such as images
    pub assets: Vec<EmittedFile>,

    pub manifest: Manifest,

    /// HTML file name -> contents
    pub html: Vec<(String, String)>,
}

/// Turns planned chunks into named output files
pub struct Emitter<'a> {
    config: &'a Config,
    graph: &'a ModuleGraph,
    chunks: &'a ChunkGraph,
    optimizer: Option<&'a dyn Optimizer>,
}

impl<'a> Emitter<'a> {
    pub fn new(
        config: &'a Config,
        graph: &'a ModuleGraph,
        chunks: &'a ChunkGraph,
        optimizer: Option<&'a dyn Optimizer>,
    ) -> Self {
        Self {
            config,
            graph,
            chunks,
            optimizer,
        }
    }

    /// Link, optimize and name every chunk
    ///
    /// The runtime chunk is linked last since it embeds the file names of
    /// the chunks it may load.
    pub fn render(&self) -> Result<Emission, BuildError> {
        let mut files = Vec::new();
        let mut chunk_files: Vec<ChunkFiles> = vec![ChunkFiles::default(); self.chunks.chunks().len()];
        let build_hash = self.build_hash();

        for (id, chunk) in self.chunks.chunks().iter().enumerate() {
            if chunk.kind == ChunkKind::Runtime {
                continue;
            }

            let script = link_chunk(self.graph, self.chunks, id, &self.config.root);
            let file = self.finish(&chunk.name, chunk.kind, "js", script, &build_hash)?;
            chunk_files[id].script = Some(file.filename.clone());
            files.push(file);

            for (ext, contents) in self.collect_assets(&chunk.modules) {
                let file = self.finish(&chunk.name, chunk.kind, &ext, contents, &build_hash)?;
                chunk_files[id].assets.insert(ext, file.filename.clone());
                files.push(file);
            }
        }

        let mut locations = BTreeMap::new();
        for (id, chunk) in self.chunks.chunks().iter().enumerate() {
            if matches!(chunk.kind, ChunkKind::Entry | ChunkKind::Runtime) {
                continue;
            }
            locations.insert(
                chunk.name.clone(),
                ChunkLocation {
                    js: chunk_files[id].script.clone(),
                    css: chunk_files[id].assets.get("css").cloned().into_iter().collect(),
                    deps: self
                        .chunks
                        .required_chunks(id)
                        .into_iter()
                        .map(|dep| self.chunks.chunk(dep).name.clone())
                        .collect(),
                },
            );
        }

        let runtime_id = self.chunks.runtime();
        let runtime = self.chunks.chunk(runtime_id);
        let source = render_runtime(&locations, &self.config.output.public_url);
        let file = self.finish(&runtime.name, runtime.kind, "js", source, &build_hash)?;
        chunk_files[runtime_id].script = Some(file.filename.clone());
        files.push(file);

        let manifest = self.manifest(&chunk_files);
        let html = self.html_shells(&manifest)?;

        Ok(Emission {
            files,
            assets: self.copied_files(),
            manifest,
            html,
        })
    }

    /// Files attached to modules, once per file name, in module order
    fn copied_files(&self) -> Vec<EmittedFile> {
        let mut seen = HashSet::new();
        self.graph
            .modules()
            .flat_map(|(_, module)| module.files.iter())
            .filter(|file| seen.insert(file.filename.clone()))
            .cloned()
            .collect()
    }

    /// Optimize and name one output file
    fn finish(
        &self,
        chunk: &str,
        kind: ChunkKind,
        ext: &str,
        contents: String,
        build_hash: &str,
    ) -> Result<OutputFile, BuildError> {
        let contents = match self.optimizer {
            Some(optimizer) => optimizer
                .optimize(&contents, AssetKind::from_extension(ext))
                .map_err(|e| BuildError::Optimize {
                    chunk: chunk.to_string(),
                    message: format!("{}: {:#}", optimizer.name(), e),
                })?,
            None => contents,
        };

        let hash = match self.config.build.mode {
            Mode::Production => hash_content(contents.as_bytes(), self.config.output.hash_length),
            Mode::Development => build_hash.to_string(),
        };

        let filename = match &self.config.build.stamp {
            Some(stamp) => format!("{}.{}-{}.{}", chunk, hash, stamp, ext),
            None => format!("{}.{}.{}", chunk, hash, ext),
        };

        debug!("Emitting {} ({} bytes)", filename, contents.len());

        Ok(OutputFile {
            chunk: chunk.to_string(),
            kind,
            filename,
            contents,
        })
    }

    /// Auxiliary artifacts concatenated per extension in module order
    fn collect_assets(&self, modules: &[usize]) -> BTreeMap<String, String> {
        let mut assets: BTreeMap<String, String> = BTreeMap::new();
        for &id in modules {
            let Some(module) = self.graph.get_module(id) else {
                continue;
            };
            for asset in &module.assets {
                assets.entry(asset.ext.clone()).or_default().push_str(&asset.content);
            }
        }
        assets
    }

    /// Content-independent hash used for development file names
    fn build_hash(&self) -> String {
        let mut seed = format!(
            "{}\n{}\n{}",
            self.config.project.name,
            self.config.build.mode.as_str(),
            self.config.build.stamp.as_deref().unwrap_or_default()
        );
        for chunk in self.chunks.chunks() {
            seed.push('\n');
            seed.push_str(&chunk.name);
        }
        hash_content(seed.as_bytes(), self.config.output.hash_length)
    }

    fn manifest(&self, chunk_files: &[ChunkFiles]) -> Manifest {
        let mut manifest = Manifest::new();

        for (id, chunk) in self.chunks.entry_chunks() {
            let mut entry = ManifestEntry::default();
            for dep in self.chunks.load_order(id) {
                let files = &chunk_files[dep];
                entry.scripts.extend(files.script.iter().cloned());
                entry.styles.extend(files.assets.get("css").cloned());
            }
            manifest.insert(chunk.name.clone(), entry);
        }

        manifest
    }

    fn html_shells(&self, manifest: &Manifest) -> Result<Vec<(String, String)>, BuildError> {
        let html = &self.config.output.html;
        if !html.enabled {
            return Ok(Vec::new());
        }

        let template = match &html.template {
            Some(path) => {
                let path = self.config.root.join(path);
                Some(fs::read_to_string(&path).map_err(|source| BuildError::Emission { path, source })?)
            }
            None => None,
        };

        let public_url = &self.config.output.public_url;
        let mut shells = Vec::new();

        for (name, entry) in manifest {
            let links: String = entry
                .styles
                .iter()
                .map(|file| format!("<link rel=\"stylesheet\" href=\"{}{}\">\n", public_url, file))
                .collect();
            let scripts: String = entry
                .scripts
                .iter()
                .map(|file| format!("<script src=\"{}{}\"></script>\n", public_url, file))
                .collect();

            let page = match &template {
                Some(template) => inject(template, &links, &scripts),
                None => format!(
                    "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n{}</head>\n<body>\n{}</body>\n</html>\n",
                    self.config.project.name, links, scripts
                ),
            };

            shells.push((html.filename.replace("[name]", name), page));
        }

        Ok(shells)
    }
}

/// Insert tags before `</head>` and `</body>`, or append them when a
/// template lacks the closing tag
fn inject(template: &str, links: &str, scripts: &str) -> String {
    let mut page = template.to_string();

    match page.find("</head>") {
        Some(pos) => page.insert_str(pos, links),
        None => page.push_str(links),
    }
    match page.rfind("</body>") {
        Some(pos) => page.insert_str(pos, scripts),
        None => page.push_str(scripts),
    }

    page
}

impl Emission {
    /// Stage every output, move chunks, copied files and HTML shells into
    /// place, then commit the manifest
    ///
    /// Returns the paths written, manifest and shells included.
    pub fn write(&self, out_dir: &Path, clean: bool) -> Result<Vec<PathBuf>, BuildError> {
        fs::create_dir_all(out_dir).map_err(|source| BuildError::Emission {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let manifest = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| BuildError::Emission {
                path: out_dir.join(MANIFEST_FILE),
                source: e.into(),
            })?;

        let mut staged = Vec::new();
        for file in &self.files {
            staged.push((out_dir.join(&file.filename), stage(out_dir, file.contents.as_bytes())?));
        }
        for file in &self.assets {
            staged.push((out_dir.join(&file.filename), stage(out_dir, &file.contents)?));
        }
        for (name, contents) in &self.html {
            staged.push((out_dir.join(name), stage(out_dir, contents.as_bytes())?));
        }
        staged.push((out_dir.join(MANIFEST_FILE), stage(out_dir, manifest.as_bytes())?));

        let mut written = Vec::new();
        for (path, tmp) in staged {
            tmp.persist(&path).map_err(|e| BuildError::Emission {
                path: path.clone(),
                source: e.error,
            })?;
            written.push(path);
        }

        info!("Committed {}", MANIFEST_FILE);

        if clean {
            remove_stale(out_dir, &written);
        }

        Ok(written)
    }
}

/// Write `contents` to a temporary file inside `dir`
fn stage(dir: &Path, contents: &[u8]) -> Result<NamedTempFile, BuildError> {
    let to_error = |source| BuildError::Emission {
        path: dir.to_path_buf(),
        source,
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(to_error)?;
    tmp.write_all(contents).map_err(to_error)?;
    tmp.flush().map_err(to_error)?;
    Ok(tmp)
}

/// Remove files this build did not produce
fn remove_stale(out_dir: &Path, keep: &[PathBuf]) {
    let keep: HashSet<&Path> = keep.iter().map(PathBuf::as_path).collect();

    for entry in WalkDir::new(out_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if keep.contains(entry.path()) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => debug!("Removed stale file {}", entry.path().display()),
            Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }
}
