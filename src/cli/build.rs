//! Build command implementation

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use tracing::info;

use super::report_failure;
use crate::bundler::Bundler;
use crate::config::{Config, Mode};
use crate::utils::{format_duration, format_size};

/// Build the project and write hashed bundles
#[derive(Args, Debug)]
pub struct BuildCommand {
    /// Output directory
    #[arg(short, long)]
    pub outdir: Option<PathBuf>,

    /// Build mode
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Build stamp appended to hashed filenames (e.g. a commit hash)
    #[arg(long, env = "HASHPACK_STAMP")]
    pub stamp: Option<String>,

    /// Skip the optimizer
    #[arg(long)]
    pub no_minify: bool,

    /// Print the manifest or the errors as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl BuildCommand {
    pub async fn execute(&self, config_path: &str) -> Result<()> {
        info!("Loading configuration from {}", config_path);
        let config = Config::load(config_path)?;

        eprintln!(
            "{} Building {} v{}...",
            "→".blue(),
            config.project.name.bold(),
            config.project.version
        );

        let bundler = Bundler::new(config, self.into())?;
        let result = match bundler.build().await {
            Ok(result) => result,
            Err(failure) => {
                report_failure(&failure, self.json);
                bail!("build failed with {} error(s)", failure.errors.len());
            }
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result.manifest)?);
        }

        eprintln!(
            "\n{} Built {} file(s) from {} module(s) in {}\n",
            "✓".green().bold(),
            result.bundles.len() + result.assets.len(),
            result.modules,
            format_duration(result.duration)
        );

        // Print bundle summary
        for bundle in &result.bundles {
            eprintln!(
                "  {} {} {} {}",
                "•".dimmed(),
                bundle.output_path.display().to_string().cyan(),
                format!("[{}]", bundle.kind.as_str()).dimmed(),
                format_size(bundle.size).dimmed()
            );
        }

        for asset in &result.assets {
            eprintln!(
                "  {} {} {} {}",
                "•".dimmed(),
                asset.output_path.display().to_string().cyan(),
                "[file]".dimmed(),
                format_size(asset.size).dimmed()
            );
        }

        eprintln!();

        Ok(())
    }
}

/// Build options derived from command arguments
///
/// Every field overrides the matching configuration value when set.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub outdir: Option<PathBuf>,
    pub mode: Option<Mode>,
    pub stamp: Option<String>,
    pub minify: Option<bool>,
}

impl BuildOptions {
    /// Apply the overrides to `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(outdir) = &self.outdir {
            config.output.dir = outdir.display().to_string();
        }
        if let Some(mode) = self.mode {
            config.build.mode = mode;
        }
        if let Some(stamp) = &self.stamp {
            config.build.stamp = Some(stamp.clone());
        }
        if let Some(minify) = self.minify {
            config.optimizer.enabled = Some(minify);
        }
    }
}

impl From<&BuildCommand> for BuildOptions {
    fn from(cmd: &BuildCommand) -> Self {
        // Relative output directories are taken from the working directory
        let outdir = cmd.outdir.as_ref().map(|dir| {
            std::env::current_dir()
                .map(|cwd| cwd.join(dir))
                .unwrap_or_else(|_| dir.clone())
        });

        Self {
            outdir,
            mode: cmd.mode,
            stamp: cmd.stamp.clone(),
            minify: cmd.no_minify.then_some(false),
        }
    }
}
