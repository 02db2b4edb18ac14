//! Configuration handling for hashpack
//!
//! Parses and manages hashpack.toml configuration files.

mod schema;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use schema::*;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Project metadata
    #[serde(default)]
    pub project: ProjectConfig,

    /// Entry name -> module reference, in declaration order
    #[serde(default)]
    pub entries: IndexMap<String, String>,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Module resolution
    #[serde(default)]
    pub resolve: ResolveConfig,

    /// Cache-group rules, in declaration order
    #[serde(default)]
    pub cache_groups: Vec<CacheGroupConfig>,

    /// Implicit shared chunk
    #[serde(default)]
    pub split: SplitConfig,

    /// Transform rules keyed by content type
    #[serde(default)]
    pub transforms: TransformRules,

    /// Optimizer slot
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Build session settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Root directory (computed from config file location)
    #[serde(skip)]
    pub root: PathBuf,
}

impl Config {
    /// Load configuration from a file path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let canonical_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let content = fs::read_to_string(&canonical_path)
            .with_context(|| format!("Failed to read config file: {}", canonical_path.display()))?;
        let canonical_path = fs::canonicalize(&canonical_path).unwrap_or(canonical_path);

        let root = canonical_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Self::from_toml(&content, root)
    }

    /// Parse configuration from TOML text rooted at `root`
    pub fn from_toml(content: &str, root: PathBuf) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse hashpack.toml")?;
        config.root = root;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration rooted at `root` with a single entry
    pub fn default_config(root: impl Into<PathBuf>) -> Self {
        let mut entries = IndexMap::new();
        entries.insert("main".to_string(), "./src/index".to_string());

        Self {
            entries,
            root: root.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            anyhow::bail!("At least one entry must be specified in hashpack.toml");
        }

        if !(4..=64).contains(&self.output.hash_length) {
            anyhow::bail!(
                "output.hash_length must be between 4 and 64, got {}",
                self.output.hash_length
            );
        }

        for group in &self.cache_groups {
            Regex::new(&group.test)
                .with_context(|| format!("Invalid test pattern in cache group '{}'", group.name))?;
            if group.name == self.split.name {
                anyhow::bail!(
                    "Cache group '{}' collides with the shared chunk name",
                    group.name
                );
            }
        }

        for (content_type, rule) in &self.transforms {
            if let Some(exclude) = &rule.exclude {
                Regex::new(exclude).with_context(|| {
                    format!("Invalid exclude pattern for transforms.{}", content_type)
                })?;
            }
        }

        if self.build.workers == Some(0) {
            anyhow::bail!("build.workers must be greater than zero");
        }

        if let Some(stamp) = &self.build.stamp {
            if stamp.is_empty() || !stamp.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                anyhow::bail!("build.stamp must be a non-empty filename-safe token, got '{}'", stamp);
            }
        }

        Ok(())
    }

    /// Get the absolute output directory path
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.output.dir)
    }

    /// Whether the optimizer runs for this build
    pub fn optimize_enabled(&self) -> bool {
        self.optimizer
            .enabled
            .unwrap_or(self.build.mode == Mode::Production)
    }

    /// Worker count for module processing
    pub fn workers(&self) -> usize {
        self.build.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Absolute resolution roots, in declared order
    pub fn resolve_roots(&self) -> Vec<PathBuf> {
        self.resolve
            .roots
            .iter()
            .map(|r| self.root.join(r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [project]
            name = "demo"

            [entries]
            main = "./src/index"
            admin = "./src/admin"

            [output]
            dir = "build"
            hash_length = 10

            [resolve]
            roots = ["node_modules", "lib"]
            extensions = [".ts", ".js"]

            [[cache_groups]]
            name = "web-sdk"
            test = "[\\\\/]node_modules[\\\\/]white-web-sdk[\\\\/]"
            priority = 10

            [[cache_groups]]
            name = "vendor"
            test = "[\\\\/]node_modules[\\\\/]"
            priority = 1

            [transforms.ts]
            stages = ["strip-types", "scan-imports"]
            exclude = "node_modules"

            [build]
            mode = "development"
            stamp = "abc123"
        "#;

        let config = Config::from_toml(toml, PathBuf::from("/project")).unwrap();

        let names: Vec<_> = config.entries.keys().cloned().collect();
        assert_eq!(names, vec!["main", "admin"]);
        assert_eq!(config.output.hash_length, 10);
        assert_eq!(config.cache_groups.len(), 2);
        assert_eq!(config.cache_groups[0].priority, 10);
        assert_eq!(config.transforms["ts"].stages, vec!["strip-types", "scan-imports"]);
        assert_eq!(config.build.mode, Mode::Development);
        assert!(!config.optimize_enabled());
        assert_eq!(config.output_dir(), PathBuf::from("/project/build"));
        assert_eq!(
            config.resolve_roots(),
            vec![PathBuf::from("/project/node_modules"), PathBuf::from("/project/lib")]
        );
    }

    #[test]
    fn test_rejects_missing_entries() {
        let err = Config::from_toml("[project]\nname = \"x\"\n", PathBuf::from("/p")).unwrap_err();
        assert!(err.to_string().contains("entry"));
    }

    #[test]
    fn test_rejects_bad_cache_group_pattern() {
        let toml = r#"
            [entries]
            main = "./a"

            [[cache_groups]]
            name = "broken"
            test = "(unclosed"
        "#;
        assert!(Config::from_toml(toml, PathBuf::from("/p")).is_err());
    }

    #[test]
    fn test_rejects_unsafe_stamp() {
        let toml = "[entries]\nmain = \"./a\"\n[build]\nstamp = \"../x\"\n";
        assert!(Config::from_toml(toml, PathBuf::from("/p")).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default_config("/p");
        assert_eq!(config.output.hash_length, 8);
        assert_eq!(config.split.name, "common");
        assert!(config.optimize_enabled());
        assert_eq!(config.resolve.main_fields, vec!["main", "module"]);
        assert!(config.validate().is_ok());
    }
}
