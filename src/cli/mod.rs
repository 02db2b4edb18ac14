//! Command-line interface for hashpack
//!
//! Provides the main CLI structure using clap with subcommands for:
//! - `build`: Build and emit hashed bundles
//! - `check`: Build the module graph and print the chunk plan

mod build;
mod check;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::error::BuildFailure;

pub use build::{BuildCommand, BuildOptions};
pub use check::CheckCommand;

/// hashpack - a content-hashing asset bundler
#[derive(Parser, Debug)]
#[command(name = "hashpack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to hashpack.toml config file
    #[arg(short, long, global = true, default_value = "hashpack.toml", env = "HASHPACK_CONFIG")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the project and write hashed bundles
    Build(BuildCommand),

    /// Resolve the module graph and print the chunk plan without writing
    Check(CheckCommand),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<()> {
        print_banner();

        match &self.command {
            Commands::Build(cmd) => cmd.execute(&self.config).await,
            Commands::Check(cmd) => cmd.execute(&self.config).await,
        }
    }
}

/// Print the hashpack banner
fn print_banner() {
    eprintln!(
        "\n{} {} {}\n",
        "#".cyan(),
        "hashpack".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
}

/// Print every error of a failed build, as text or as a JSON array
fn report_failure(failure: &BuildFailure, json: bool) {
    let records = failure.records();

    if json {
        match serde_json::to_string_pretty(&records) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("failed to serialize errors: {}", e),
        }
        return;
    }

    eprintln!(
        "\n{} Build failed with {} error(s)\n",
        "✗".red().bold(),
        records.len()
    );
    for record in records {
        eprintln!(
            "  {} {} {}",
            format!("[{}]", record.stage).yellow(),
            record.module.as_deref().unwrap_or("<build>").cyan(),
            record.message
        );
    }
    eprintln!();
}
