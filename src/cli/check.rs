//! Check command implementation

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use tracing::info;

use super::report_failure;
use crate::bundler::Bundler;
use crate::config::Config;
use crate::utils::relative_path;

/// Resolve the module graph and print the chunk plan without writing
#[derive(Args, Debug)]
pub struct CheckCommand {
    /// Print errors as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl CheckCommand {
    pub async fn execute(&self, config_path: &str) -> Result<()> {
        info!("Loading configuration from {}", config_path);
        let config = Config::load(config_path)?;
        let root = config.root.clone();

        let bundler = Bundler::new(config, Default::default())?;
        let (graph, chunks) = match bundler.plan().await {
            Ok(plan) => plan,
            Err(failure) => {
                report_failure(&failure, self.json);
                bail!("check failed with {} error(s)", failure.errors.len());
            }
        };

        eprintln!(
            "{} {} module(s) in {} chunk(s)\n",
            "✓".green().bold(),
            graph.len(),
            chunks.chunks().len()
        );

        for chunk in chunks.chunks() {
            let deps: Vec<&str> = chunk
                .deps
                .iter()
                .map(|&d| chunks.chunk(d).name.as_str())
                .collect();

            println!(
                "{} {} {}{}",
                chunk.name.bold(),
                format!("[{}]", chunk.kind.as_str()).dimmed(),
                format!("{} module(s)", chunk.len()).dimmed(),
                if deps.is_empty() {
                    String::new()
                } else {
                    format!(" after {}", deps.join(", "))
                }
            );

            for &id in &chunk.modules {
                if let Some(module) = graph.get_module(id) {
                    let path = relative_path(&root, &module.path)
                        .unwrap_or_else(|| module.path.display().to_string());
                    println!("  {} {}", "•".dimmed(), path);
                }
            }
        }

        Ok(())
    }
}
