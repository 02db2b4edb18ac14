//! hashpack library
//!
//! Core functionality for the hashpack bundler: module resolution, the
//! transform pipeline, chunk planning and content-hashed emission.

pub mod bundler;
pub mod cli;
pub mod config;
pub mod error;
pub mod resolver;
pub mod transform;
pub mod utils;

pub use bundler::{BuildResult, Bundler};
pub use cli::{BuildOptions, Cli};
pub use config::Config;
pub use error::{BuildError, BuildFailure};
