//! Module resolution
//!
//! Maps a reference string and the requesting module to a canonical module
//! identity. Relative and absolute references resolve against the
//! filesystem directly; bare references are looked up under the configured
//! roots in declared order, and the first root that resolves wins.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::bundler::ContentType;
use crate::config::Config;
use crate::error::ResolveError;

/// A resolved module identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Canonical absolute path
    pub path: PathBuf,
    pub content_type: ContentType,
}

/// Module resolver
///
/// Pure over the filesystem state at call time; results are a snapshot.
#[derive(Debug, Clone)]
pub struct Resolver {
    /// Project root, base for entry references
    root: PathBuf,

    /// Absolute roots for bare references, in priority order
    roots: Vec<PathBuf>,

    /// Extensions appended to references, in order, with leading dots
    extensions: Vec<String>,

    /// `package.json` entry fields, in order
    main_fields: Vec<String>,
}

impl Resolver {
    /// Create a new resolver
    pub fn new(config: &Config) -> Self {
        let extensions = config
            .resolve
            .extensions
            .iter()
            .map(|ext| {
                if ext.starts_with('.') {
                    ext.clone()
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();

        Self {
            root: config.root.clone(),
            roots: config.resolve_roots(),
            extensions,
            main_fields: config.resolve.main_fields.clone(),
        }
    }

    /// Resolve `specifier` as imported from `from`
    ///
    /// `from` is `None` for entry references, which always resolve against
    /// the project root, with or without a leading `./`.
    pub fn resolve(&self, specifier: &str, from: Option<&Path>) -> Result<ResolvedModule, ResolveError> {
        debug!(
            "Resolving '{}' from '{}'",
            specifier,
            from.map(|p| p.display().to_string()).unwrap_or_else(|| "<root>".into())
        );

        let mut tried = Vec::new();

        let found = if from.is_none() || is_relative(specifier) {
            let base_dir = match from {
                Some(path) => path.parent().unwrap_or(Path::new("/")).to_path_buf(),
                None => self.root.clone(),
            };
            self.resolve_path(&base_dir.join(specifier), &mut tried)
        } else if Path::new(specifier).is_absolute() {
            self.resolve_path(Path::new(specifier), &mut tried)
        } else {
            self.resolve_bare(specifier, &mut tried)
        };

        let Some(path) = found else {
            return Err(ResolveError::NotFound {
                specifier: specifier.to_string(),
                tried,
            });
        };

        let path = fs::canonicalize(&path).unwrap_or(path);
        debug!("Resolved to: {}", path.display());

        Ok(ResolvedModule {
            content_type: ContentType::from_path(&path),
            path,
        })
    }

    /// Resolve a bare reference against each root in declared order
    fn resolve_bare(&self, specifier: &str, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        self.roots
            .iter()
            .find_map(|root| self.resolve_path(&root.join(specifier), tried))
    }

    /// Try a base path as a file, with extensions, as a package and as a
    /// directory index, in that order
    fn resolve_path(&self, target: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        if let Some(file) = self.resolve_file(target, tried) {
            return Some(file);
        }

        if target.is_dir() {
            if let Some(entry) = self.resolve_package(target, tried) {
                return Some(entry);
            }

            return self.resolve_file(&target.join("index"), tried);
        }

        None
    }

    /// Exact file, then each extension appended
    fn resolve_file(&self, target: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        tried.push(target.to_path_buf());
        if target.is_file() {
            return Some(target.to_path_buf());
        }

        for ext in &self.extensions {
            let mut candidate = target.as_os_str().to_owned();
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);

            tried.push(candidate.clone());
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        None
    }

    /// Entry named by `package.json` through the configured main fields
    fn resolve_package(&self, package_dir: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        let package_json = package_dir.join("package.json");
        let content = fs::read_to_string(&package_json).ok()?;

        let pkg: serde_json::Value = match serde_json::from_str(&content) {
            Ok(pkg) => pkg,
            Err(e) => {
                debug!("Ignoring unreadable {}: {}", package_json.display(), e);
                return None;
            }
        };

        for field in &self.main_fields {
            let Some(main) = pkg.get(field).and_then(|v| v.as_str()) else {
                continue;
            };

            let target = package_dir.join(main);
            if let Some(file) = self.resolve_file(&target, tried) {
                return Some(file);
            }
            if target.is_dir() {
                if let Some(file) = self.resolve_file(&target.join("index"), tried) {
                    return Some(file);
                }
            }
        }

        None
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::canonicalize(path).unwrap()
    }

    fn resolver(root: &Path, toml: &str) -> Resolver {
        let config = Config::from_toml(
            &format!("[entries]\nmain = \"./src/index\"\n{}", toml),
            root.to_path_buf(),
        )
        .unwrap();
        Resolver::new(&config)
    }

    #[test]
    fn test_entry_resolves_against_root_with_extension_order() {
        let tmp = TempDir::new().unwrap();
        let ts = write(tmp.path(), "src/index.ts", "");
        write(tmp.path(), "src/index.js", "");

        let r = resolver(tmp.path(), "[resolve]\nextensions = [\".ts\", \".js\"]\n");
        let resolved = r.resolve("./src/index", None).unwrap();
        assert_eq!(resolved.path, ts);
        assert_eq!(resolved.content_type, ContentType::TypeScript);

        let r = resolver(tmp.path(), "[resolve]\nextensions = [\"js\", \"ts\"]\n");
        assert!(r.resolve("src/index", None).unwrap().path.ends_with("src/index.js"));
    }

    #[test]
    fn test_relative_to_importer() {
        let tmp = TempDir::new().unwrap();
        let index = write(tmp.path(), "src/index.js", "");
        let util = write(tmp.path(), "src/lib/util.js", "");

        let r = resolver(tmp.path(), "");
        assert_eq!(r.resolve("./lib/util", Some(&index)).unwrap().path, util);
        assert_eq!(r.resolve("../index.js", Some(&util)).unwrap().path, index);
    }

    #[test]
    fn test_extension_is_appended_not_replaced() {
        let tmp = TempDir::new().unwrap();
        let index = write(tmp.path(), "src/index.js", "");
        let config = write(tmp.path(), "src/app.config.ts", "");

        let r = resolver(tmp.path(), "");
        assert_eq!(r.resolve("./app.config", Some(&index)).unwrap().path, config);
    }

    #[test]
    fn test_directory_index() {
        let tmp = TempDir::new().unwrap();
        let index = write(tmp.path(), "src/index.js", "");
        let widget = write(tmp.path(), "src/widget/index.tsx", "");

        let r = resolver(tmp.path(), "");
        assert_eq!(r.resolve("./widget", Some(&index)).unwrap().path, widget);
    }

    #[test]
    fn test_bare_reference_uses_package_main_fields() {
        let tmp = TempDir::new().unwrap();
        let index = write(tmp.path(), "src/index.js", "");
        write(
            tmp.path(),
            "node_modules/lib/package.json",
            r#"{"main": "dist/lib.cjs.js", "module": "dist/lib.esm.js"}"#,
        );
        let cjs = write(tmp.path(), "node_modules/lib/dist/lib.cjs.js", "");
        let esm = write(tmp.path(), "node_modules/lib/dist/lib.esm.js", "");

        let r = resolver(tmp.path(), "");
        assert_eq!(r.resolve("lib", Some(&index)).unwrap().path, cjs);

        let r = resolver(tmp.path(), "[resolve]\nmain_fields = [\"module\", \"main\"]\n");
        assert_eq!(r.resolve("lib", Some(&index)).unwrap().path, esm);
    }

    #[test]
    fn test_first_declared_root_wins() {
        let tmp = TempDir::new().unwrap();
        let index = write(tmp.path(), "src/index.js", "");
        let vendored = write(tmp.path(), "vendor/dep/index.js", "");
        write(tmp.path(), "node_modules/dep/index.js", "");

        let r = resolver(tmp.path(), "[resolve]\nroots = [\"vendor\", \"node_modules\"]\n");
        assert_eq!(r.resolve("dep", Some(&index)).unwrap().path, vendored);
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let tmp = TempDir::new().unwrap();
        let index = write(tmp.path(), "src/index.js", "");

        let r = resolver(tmp.path(), "[resolve]\nextensions = [\".js\"]\n");
        match r.resolve("./missing", Some(&index)) {
            Err(ResolveError::NotFound { specifier, tried }) => {
                assert_eq!(specifier, "./missing");
                assert_eq!(tried.len(), 2);
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}
