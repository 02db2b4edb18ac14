//! Optimizer slot
//!
//! Invoked once per finalized chunk or asset, after linking and before
//! hashing. A failure fails the build; unoptimized output is never shipped
//! in its place.

use anyhow::{anyhow, bail, Result};
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_minifier::{Minifier, MinifierOptions};
use oxc_parser::Parser;
use oxc_span::SourceType;

/// Kind of content handed to the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Script,
    Stylesheet,
    Other,
}

impl AssetKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "js" => AssetKind::Script,
            "css" => AssetKind::Stylesheet,
            _ => AssetKind::Other,
        }
    }
}

/// An optimizer delegate
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    fn optimize(&self, source: &str, kind: AssetKind) -> Result<String>;
}

/// Look up a built-in optimizer by name
pub fn builtin(name: &str) -> Option<Box<dyn Optimizer>> {
    match name {
        "basic" => Some(Box::new(BasicOptimizer)),
        _ => None,
    }
}

/// `oxc_minifier` for scripts, `lightningcss` for stylesheets; other assets
/// pass through
pub struct BasicOptimizer;

impl Optimizer for BasicOptimizer {
    fn name(&self) -> &str {
        "basic"
    }

    fn optimize(&self, source: &str, kind: AssetKind) -> Result<String> {
        match kind {
            AssetKind::Script => minify_script(source),
            AssetKind::Stylesheet => minify_stylesheet(source),
            AssetKind::Other => Ok(source.to_string()),
        }
    }
}

/// Minify a stylesheet with lightningcss
pub fn minify_stylesheet(source: &str) -> Result<String> {
    let mut sheet = StyleSheet::parse(source, ParserOptions::default())
        .map_err(|e| anyhow!("invalid stylesheet: {}", e))?;

    sheet
        .minify(MinifyOptions::default())
        .map_err(|e| anyhow!("stylesheet minification failed: {}", e))?;

    let printed = sheet
        .to_css(PrinterOptions {
            minify: true,
            ..PrinterOptions::default()
        })
        .map_err(|e| anyhow!("stylesheet printing failed: {}", e))?;

    Ok(printed.code)
}

/// Minify a script with the oxc parser, compressor and code generator
///
/// Local names are kept so stack traces still read like the source. Anything
/// that does not parse as a classic script is rejected.
pub fn minify_script(source: &str) -> Result<String> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::cjs()).parse();

    if let Some(error) = parsed.errors.first() {
        bail!("invalid script: {}", error);
    }
    if parsed.panicked {
        bail!("invalid script");
    }

    let mut program = parsed.program;
    let options = MinifierOptions {
        mangle: None,
        ..MinifierOptions::default()
    };
    let minified = Minifier::new(options).minify(&allocator, &mut program);

    let printed = Codegen::new()
        .with_options(CodegenOptions::minify())
        .with_scoping(minified.scoping)
        .build(&program);

    Ok(printed.code)
}
