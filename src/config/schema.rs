//! Configuration schema definitions

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Project metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name
    pub name: String,

    /// Project version
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "my-app".to_string(),
            version: default_version(),
        }
    }
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory
    #[serde(default = "default_output_dir")]
    pub dir: String,

    /// Public URL prefix for assets referenced from HTML shells
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Number of hex digest characters used in output filenames
    #[serde(default = "default_hash_length")]
    pub hash_length: usize,

    /// Remove files from previous builds once the new manifest is committed
    #[serde(default)]
    pub clean: bool,

    /// HTML shell generation
    #[serde(default)]
    pub html: HtmlConfig,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            public_url: default_public_url(),
            hash_length: default_hash_length(),
            clean: false,
            html: HtmlConfig::default(),
        }
    }
}

fn default_output_dir() -> String {
    "dist".to_string()
}

fn default_public_url() -> String {
    "/".to_string()
}

fn default_hash_length() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// HTML shell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlConfig {
    /// Generate one HTML shell per entry
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Template file, relative to the project root
    #[serde(default)]
    pub template: Option<String>,

    /// Output filename pattern; `[name]` is replaced by the entry name
    #[serde(default = "default_html_filename")]
    pub filename: String,
}

impl Default for HtmlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template: None,
            filename: default_html_filename(),
        }
    }
}

fn default_html_filename() -> String {
    "[name].html".to_string()
}

/// Module resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConfig {
    /// Directories searched for bare references, in priority order
    #[serde(default = "default_roots")]
    pub roots: Vec<String>,

    /// Extensions appended to extension-less references, in order
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// `package.json` fields naming a package entry, in order
    #[serde(default = "default_main_fields")]
    pub main_fields: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            extensions: default_extensions(),
            main_fields: default_main_fields(),
        }
    }
}

fn default_roots() -> Vec<String> {
    vec!["node_modules".to_string()]
}

fn default_extensions() -> Vec<String> {
    [".ts", ".tsx", ".js", ".jsx", ".json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_main_fields() -> Vec<String> {
    vec!["main".to_string(), "module".to_string()]
}

/// A rule that routes matching modules into a named chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheGroupConfig {
    /// Target chunk name
    pub name: String,

    /// Regular expression matched against the module path (`/` separators)
    pub test: String,

    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,
}

/// Implicit shared-chunk extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Extract modules shared between chunks
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the shared chunk
    #[serde(default = "default_shared_name")]
    pub name: String,

    /// Distinct synchronous importers needed to extract a module
    #[serde(default = "default_min_refs")]
    pub min_refs: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_shared_name(),
            min_refs: default_min_refs(),
        }
    }
}

fn default_shared_name() -> String {
    "common".to_string()
}

fn default_min_refs() -> usize {
    2
}

/// Transform stages applied to one content type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformRuleConfig {
    /// Stage names, run in order
    #[serde(default)]
    pub stages: Vec<String>,

    /// Modules whose path matches this expression skip the rule
    #[serde(default)]
    pub exclude: Option<String>,
}

/// Optimizer slot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Run the optimizer; defaults to on in production and off in development
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Script minifier name
    #[serde(default = "default_minifier")]
    pub minifier: String,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            minifier: default_minifier(),
        }
    }
}

fn default_minifier() -> String {
    "basic".to_string()
}

/// Build mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Stable non-content filenames for fast iteration
    Development,
    /// Full content hashing and optimization
    #[default]
    Production,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }
}

/// Build session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub mode: Mode,

    /// Build stamp (e.g. a VCS revision) appended to hashed filenames
    #[serde(default)]
    pub stamp: Option<String>,

    /// Worker count for module processing; defaults to available parallelism
    #[serde(default)]
    pub workers: Option<usize>,

    /// Upper bound for resolving and transforming a single module
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            stamp: None,
            workers: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Ordered map of content type to transform rule
pub type TransformRules = IndexMap<String, TransformRuleConfig>;
