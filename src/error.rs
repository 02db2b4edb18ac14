//! Build error taxonomy
//!
//! Resolution, transform and timeout errors are collected per module so a
//! failed build reports every offending module at once. Cycles, optimizer
//! failures and emission failures end the build immediately.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors produced by the module resolver
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No candidate file exists for the reference
    #[error("cannot resolve '{specifier}' (tried {} candidate(s))", .tried.len())]
    NotFound {
        specifier: String,
        tried: Vec<PathBuf>,
    },
}

/// A single build error attributed to a module, stage or chunk
#[derive(Debug, Error)]
pub enum BuildError {
    /// A module reference could not be mapped to a module
    #[error("{}: {source}", importer_label(.importer))]
    Resolution {
        importer: Option<PathBuf>,
        #[source]
        source: ResolveError,
    },

    /// A transform stage rejected or failed on a module
    #[error("{}: stage '{stage}' failed: {message}", .module.display())]
    Transform {
        module: PathBuf,
        stage: String,
        message: String,
    },

    /// Illegal synchronous import cycle
    #[error("synchronous import cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<PathBuf> },

    /// The optimizer delegate failed on a chunk
    #[error("optimizing chunk '{chunk}' failed: {message}")]
    Optimize { chunk: String, message: String },

    /// Writing an output file failed
    #[error("failed to write {}: {source}", .path.display())]
    Emission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Processing a module exceeded the configured timeout
    #[error("{}: timed out during '{stage}'", .module.display())]
    Timeout { module: PathBuf, stage: String },
}

fn importer_label(importer: &Option<PathBuf>) -> String {
    match importer {
        Some(path) => path.display().to_string(),
        None => "<entry>".to_string(),
    }
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Flat record of a build error for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub module: Option<String>,
    pub stage: String,
    pub message: String,
}

impl BuildError {
    /// The phase or stage that produced the error
    pub fn stage(&self) -> &str {
        match self {
            BuildError::Resolution { .. } => "resolve",
            BuildError::Transform { stage, .. } => stage.as_str(),
            BuildError::CyclicDependency { .. } => "graph",
            BuildError::Optimize { .. } => "optimize",
            BuildError::Emission { .. } => "emit",
            BuildError::Timeout { stage, .. } => stage.as_str(),
        }
    }

    /// The module (or chunk) the error is attributed to
    pub fn module(&self) -> Option<String> {
        match self {
            BuildError::Resolution { importer, .. } => {
                importer.as_ref().map(|p| p.display().to_string())
            }
            BuildError::Transform { module, .. } | BuildError::Timeout { module, .. } => {
                Some(module.display().to_string())
            }
            BuildError::CyclicDependency { cycle } => {
                cycle.first().map(|p| p.display().to_string())
            }
            BuildError::Optimize { chunk, .. } => Some(chunk.clone()),
            BuildError::Emission { path, .. } => Some(path.display().to_string()),
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        let message = match self {
            BuildError::Resolution { source, .. } => source.to_string(),
            BuildError::Transform { message, .. } => message.clone(),
            BuildError::Optimize { message, .. } => message.clone(),
            other => other.to_string(),
        };

        ErrorRecord {
            module: self.module(),
            stage: self.stage().to_string(),
            message,
        }
    }
}

/// A failed build: every error collected before the build stopped
#[derive(Debug)]
pub struct BuildFailure {
    pub errors: Vec<BuildError>,
}

impl BuildFailure {
    pub fn new(errors: Vec<BuildError>) -> Self {
        Self { errors }
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.errors.iter().map(BuildError::to_record).collect()
    }
}

impl From<BuildError> for BuildFailure {
    fn from(error: BuildError) -> Self {
        Self::new(vec![error])
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build failed with {} error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_carry_module_and_stage() {
        let err = BuildError::Transform {
            module: PathBuf::from("/src/a.ts"),
            stage: "strip-types".to_string(),
            message: "unexpected token".to_string(),
        };

        let record = err.to_record();
        assert_eq!(record.module.as_deref(), Some("/src/a.ts"));
        assert_eq!(record.stage, "strip-types");
        assert_eq!(record.message, "unexpected token");
    }

    #[test]
    fn test_cycle_message_names_every_module() {
        let err = BuildError::CyclicDependency {
            cycle: vec![
                PathBuf::from("/a.js"),
                PathBuf::from("/b.js"),
                PathBuf::from("/a.js"),
            ],
        };
        assert_eq!(err.to_string(), "synchronous import cycle: /a.js -> /b.js -> /a.js");
    }

    #[test]
    fn test_failure_display_lists_all_errors() {
        let failure = BuildFailure::new(vec![
            BuildError::Resolution {
                importer: None,
                source: ResolveError::NotFound {
                    specifier: "./missing".to_string(),
                    tried: vec![],
                },
            },
            BuildError::Timeout {
                module: PathBuf::from("/slow.js"),
                stage: "transform".to_string(),
            },
        ]);

        let text = failure.to_string();
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("<entry>: cannot resolve './missing'"));
        assert!(text.contains("/slow.js: timed out"));
    }
}
