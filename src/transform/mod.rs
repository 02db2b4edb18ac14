//! Transform registry
//!
//! Maps a module's content type to an ordered list of transform stages.
//! Stages are capabilities registered by name; configuration picks which
//! stages run for which content type.

mod stages;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::bundler::{AuxAsset, ContentType, EmittedFile, ImportRef};
use crate::config::Config;
use crate::error::BuildError;
use crate::utils::panic_message;

pub use stages::{
    EsmToCjsStage, ExtractCssStage, FileStage, JsonStage, ScanImportsStage, StripTypesStage,
};

/// Output of a single transform stage
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Rewritten source
    pub code: String,

    /// Import references discovered by this stage
    pub imports: Vec<ImportRef>,

    /// Side-channel artifacts extracted by this stage
    pub assets: Vec<AuxAsset>,

    /// Files to copy into the output directory
    pub files: Vec<EmittedFile>,
}

impl StageOutput {
    /// Output that only rewrites the source
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

/// A transform stage capability
pub trait TransformStage: Send + Sync {
    /// Stage name as referenced from configuration
    fn name(&self) -> &str;

    /// Transform `source` belonging to module `module`
    fn apply(&self, source: &str, module: &Path) -> Result<StageOutput>;

    /// Transform the raw file contents when this stage runs first
    ///
    /// Text stages decode the bytes as UTF-8; binary loaders override this.
    fn apply_bytes(&self, bytes: &[u8], module: &Path) -> Result<StageOutput> {
        let source = std::str::from_utf8(bytes).context("module is not valid UTF-8")?;
        self.apply(source, module)
    }
}

/// Result of running a module through its pipeline
#[derive(Debug, Clone, Default)]
pub struct Transformed {
    pub code: String,
    pub imports: Vec<ImportRef>,
    pub assets: Vec<AuxAsset>,
    pub files: Vec<EmittedFile>,
}

struct Rule {
    stages: Vec<Arc<dyn TransformStage>>,
    exclude: Option<Regex>,
}

/// Registry of transform stages and per-content-type pipelines
///
/// Read-only once a build starts; shared between workers behind an `Arc`.
pub struct TransformRegistry {
    stages: HashMap<String, Arc<dyn TransformStage>>,
    rules: HashMap<String, Rule>,
    configured: Vec<(String, Vec<String>, Option<String>)>,
}

impl TransformRegistry {
    /// Create a registry holding the built-in stages and the configured rules
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_stages(config, Vec::new())
    }

    /// Create a registry with additional stages available to configured rules
    ///
    /// A custom stage replaces a built-in stage of the same name.
    pub fn with_stages(config: &Config, custom: Vec<Arc<dyn TransformStage>>) -> Result<Self> {
        let mut registry = Self {
            stages: HashMap::new(),
            rules: HashMap::new(),
            configured: Vec::new(),
        };

        registry.register(Arc::new(ScanImportsStage));
        registry.register(Arc::new(StripTypesStage));
        registry.register(Arc::new(EsmToCjsStage));
        registry.register(Arc::new(JsonStage));
        registry.register(Arc::new(ExtractCssStage));
        registry.register(Arc::new(FileStage::new(config)));
        for stage in custom {
            registry.register(stage);
        }

        for (content_type, stages) in DEFAULT_RULES {
            registry.configured.push((
                content_type.to_string(),
                stages.iter().map(|s| s.to_string()).collect(),
                None,
            ));
        }

        for (content_type, rule) in &config.transforms {
            registry.configured.retain(|(ct, _, _)| ct != content_type);
            registry.configured.push((
                content_type.clone(),
                rule.stages.clone(),
                rule.exclude.clone(),
            ));
        }

        registry.rebuild_rules()?;
        Ok(registry)
    }

    fn register(&mut self, stage: Arc<dyn TransformStage>) {
        debug!("Registering transform stage: {}", stage.name());
        self.stages.insert(stage.name().to_string(), stage);
    }

    fn rebuild_rules(&mut self) -> Result<()> {
        let mut rules = HashMap::new();

        for (content_type, names, exclude) in &self.configured {
            let stages = names
                .iter()
                .map(|name| {
                    self.stages.get(name).cloned().with_context(|| {
                        format!(
                            "Unknown transform stage '{}' configured for content type '{}'",
                            name, content_type
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let exclude = exclude
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("Invalid exclude pattern for '{}'", content_type))?;

            rules.insert(content_type.clone(), Rule { stages, exclude });
        }

        self.rules = rules;
        Ok(())
    }

    /// Stages that apply to a module, in run order
    pub fn stages_for(&self, content_type: &ContentType, module: &Path) -> Vec<Arc<dyn TransformStage>> {
        let Some(rule) = self.rules.get(content_type.as_str()) else {
            return Vec::new();
        };

        if let Some(exclude) = &rule.exclude {
            if exclude.is_match(&crate::utils::normalize_path(module)) {
                return Vec::new();
            }
        }

        rule.stages.clone()
    }

    /// Run a module through every stage that applies to it
    ///
    /// The first stage sees the raw file contents, later stages the code the
    /// previous one produced. The first failing stage aborts the pipeline. A
    /// stage that panics is reported like one that returned an error.
    pub fn run(
        &self,
        source: &[u8],
        module: &Path,
        content_type: &ContentType,
    ) -> Result<Transformed, BuildError> {
        let mut result = Transformed::default();
        let mut code: Option<String> = None;

        for stage in self.stages_for(content_type, module) {
            debug!("Running stage '{}' on {}", stage.name(), module.display());

            let applied = panic::catch_unwind(AssertUnwindSafe(|| match &code {
                Some(code) => stage.apply(code, module),
                None => stage.apply_bytes(source, module),
            }))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!("stage panicked: {}", panic_message(payload.as_ref())))
            });

            let output = applied.map_err(|e| BuildError::Transform {
                module: module.to_path_buf(),
                stage: stage.name().to_string(),
                message: format!("{:#}", e),
            })?;

            code = Some(output.code);
            for import in output.imports {
                if !result.imports.contains(&import) {
                    result.imports.push(import);
                }
            }
            result.assets.extend(output.assets);
            result.files.extend(output.files);
        }

        result.code = match code {
            Some(code) => code,
            None => String::from_utf8(source.to_vec()).map_err(|e| BuildError::Transform {
                module: module.to_path_buf(),
                stage: "load".to_string(),
                message: e.to_string(),
            })?,
        };

        Ok(result)
    }
}

/// Pipelines used for content types without a configured rule
const DEFAULT_RULES: &[(&str, &[&str])] = &[
    ("js", &["esm-to-cjs", "scan-imports"]),
    ("jsx", &["esm-to-cjs", "scan-imports"]),
    ("ts", &["strip-types", "esm-to-cjs", "scan-imports"]),
    ("tsx", &["strip-types", "esm-to-cjs", "scan-imports"]),
    ("css", &["extract-css"]),
    ("json", &["json"]),
    ("svg", &["file"]),
    ("png", &["file"]),
    ("jpg", &["file"]),
    ("jpeg", &["file"]),
    ("gif", &["file"]),
    ("webp", &["file"]),
    ("ico", &["file"]),
    ("woff", &["file"]),
    ("woff2", &["file"]),
    ("ttf", &["file"]),
    ("eot", &["file"]),
];
