//! Built-in transform stages
//!
//! Small stand-ins for the external compilers a real project plugs in. They
//! only need to be good enough to run a build end-to-end.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::json;

use super::{StageOutput, TransformStage};
use crate::bundler::{AuxAsset, EmittedFile, ImportRef};
use crate::config::Config;
use crate::utils::hash_content;

/// Static `import`/`export ... from` statements
static IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^|[^\w.$])(?:import|export)\s+(?:[\w*${}\s,]+?\s+from\s+)?["']([^"']+)["']"#)
        .expect("static regex")
});

static REQUIRE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^|[^\w.$])require\s*\(\s*["']([^"']+)["']\s*\)"#).expect("static regex")
});

static DYNAMIC_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^|[^\w.$])import\s*\(\s*["']([^"']+)["']\s*\)"#).expect("static regex")
});

static CSS_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\(\s*)?["']([^"']+)["']\s*\)?[^;]*;"#).expect("static regex")
});

static ESM_IMPORT_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)import\s+([\w$*{}\s,]+?)\s+from\s*["']([^"']+)["'][ \t]*;?"#)
        .expect("static regex")
});

static ESM_IMPORT_BARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)import\s*["']([^"']+)["'][ \t]*;?"#).expect("static regex")
});

static ESM_EXPORT_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)export\s*(\*(?:\s+as\s+[\w$]+)?|\{[^}]*\})\s*from\s*["']([^"']+)["'][ \t]*;?"#)
        .expect("static regex")
});

static ESM_EXPORT_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)export\s*\{([^}]*)\}[ \t]*;?"#).expect("static regex")
});

static ESM_EXPORT_DEFAULT_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)export\s+default\s+((?:async\s+)?function\s*\*?\s*([\w$]+)|class\s+([\w$]+))"#)
        .expect("static regex")
});

static ESM_EXPORT_DEFAULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)export\s+default\s+"#).expect("static regex")
});

static ESM_EXPORT_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]*)export\s+((?:async\s+)?function\s*\*?\s*([\w$]+)|class\s+([\w$]+)|(?:const|let|var)\s+([\w$]+))"#)
        .expect("static regex")
});

/// Reports import references found in script source; leaves code unchanged
pub struct ScanImportsStage;

impl ScanImportsStage {
    /// Extract references in source order
    pub fn scan(source: &str) -> Vec<ImportRef> {
        let mut found: Vec<(usize, ImportRef)> = Vec::new();

        for (regex, deferred) in [
            (&*IMPORT_REGEX, false),
            (&*REQUIRE_REGEX, false),
            (&*DYNAMIC_IMPORT_REGEX, true),
        ] {
            for cap in regex.captures_iter(source) {
                if let Some(specifier) = cap.get(1) {
                    let import = if deferred {
                        ImportRef::deferred(specifier.as_str())
                    } else {
                        ImportRef::sync(specifier.as_str())
                    };
                    found.push((specifier.start(), import));
                }
            }
        }

        found.sort_by_key(|(pos, _)| *pos);

        let mut imports: Vec<ImportRef> = Vec::with_capacity(found.len());
        for (_, import) in found {
            if !imports.contains(&import) {
                imports.push(import);
            }
        }
        imports
    }
}

impl TransformStage for ScanImportsStage {
    fn name(&self) -> &str {
        "scan-imports"
    }

    fn apply(&self, source: &str, _module: &Path) -> Result<StageOutput> {
        Ok(StageOutput {
            code: source.to_string(),
            imports: Self::scan(source),
            ..StageOutput::default()
        })
    }
}

/// Rewrites module syntax into `require` calls and `exports` properties
///
/// Chunks wrap every module in a factory function, where `import` and
/// `export` statements are not allowed. Named exports become getters
/// defined before the module body runs; `export default <expr>` becomes an
/// assignment in place. Sources without module syntax pass through unchanged.
pub struct EsmToCjsStage;

#[derive(Default)]
struct EsmRewrite {
    imports: usize,
    exports: Vec<(String, String)>,
}

impl EsmRewrite {
    fn temp(&mut self) -> String {
        let name = format!("__hp_import{}", self.imports);
        self.imports += 1;
        name
    }

    fn require(&mut self, indent: &str, specifier: &str) -> (String, String) {
        let temp = self.temp();
        let statement = format!("{}var {} = require({});", indent, temp, json!(specifier));
        (temp, statement)
    }

    fn import_from(&mut self, caps: &Captures) -> String {
        let (indent, clause, specifier) = (&caps[1], caps[2].trim(), &caps[3]);

        // `import type ...` has no runtime counterpart
        if let Some(rest) = clause.strip_prefix("type") {
            if rest.starts_with(|c: char| c.is_whitespace() || c == '{') {
                return indent.to_string();
            }
        }

        let (temp, mut out) = self.require(indent, specifier);
        let (default, rest) = match clause.find(|c: char| c == '{' || c == '*') {
            Some(0) => (None, clause),
            Some(pos) => (Some(clause[..pos].trim().trim_end_matches(',').trim()), &clause[pos..]),
            None => (Some(clause), ""),
        };

        if let Some(default) = default.filter(|d| !d.is_empty()) {
            out.push_str(&format!(" var {} = {};", default, interop_default(&temp)));
        }

        if let Some(namespace) = rest.strip_prefix('*') {
            let local = namespace.trim().trim_start_matches("as").trim();
            out.push_str(&format!(" var {} = {};", local, temp));
        } else if rest.starts_with('{') {
            for (imported, local) in named_list(rest) {
                let value = if imported == "default" {
                    interop_default(&temp)
                } else {
                    format!("{}.{}", temp, imported)
                };
                out.push_str(&format!(" var {} = {};", local, value));
            }
        }

        out
    }

    fn export_from(&mut self, caps: &Captures) -> String {
        let (indent, clause, specifier) = (&caps[1], caps[2].trim(), &caps[3]);
        let (temp, mut out) = self.require(indent, specifier);

        if let Some(namespace) = clause.strip_prefix('*') {
            let namespace = namespace.trim().trim_start_matches("as").trim();
            if namespace.is_empty() {
                out.push_str(&format!(
                    " Object.keys({t}).forEach(function (k) {{ if (k !== \"default\" && !Object.prototype.hasOwnProperty.call(exports, k)) Object.defineProperty(exports, k, {{ enumerable: true, get: function () {{ return {t}[k]; }} }}); }});",
                    t = temp
                ));
            } else {
                self.exports.push((namespace.to_string(), temp));
            }
        } else {
            for (imported, exported) in named_list(clause) {
                self.exports.push((exported, format!("{}.{}", temp, imported)));
            }
        }

        out
    }

    fn export_list(&mut self, caps: &Captures) -> String {
        for (local, exported) in named_list(&caps[2]) {
            self.exports.push((exported, local));
        }
        caps[1].to_string()
    }

    fn export_declaration(&mut self, caps: &Captures, default: bool) -> String {
        let name = caps
            .get(3)
            .or_else(|| caps.get(4))
            .or_else(|| caps.get(5))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let exported = if default { "default".to_string() } else { name.clone() };
        self.exports.push((exported, name));
        format!("{}{}", &caps[1], &caps[2])
    }

    /// Getter definitions placed ahead of the module body
    fn header(&self) -> String {
        let mut header = String::from("Object.defineProperty(exports, \"__esModule\", { value: true });");
        for (exported, local) in &self.exports {
            header.push_str(&format!(
                " Object.defineProperty(exports, {}, {{ enumerable: true, get: function () {{ return {}; }} }});",
                json!(exported),
                local
            ));
        }
        header.push('\n');
        header
    }
}

fn interop_default(temp: &str) -> String {
    format!("{t} && {t}.__esModule ? {t}.default : {t}", t = temp)
}

/// `{ a, b as c }` as `(a, a)`, `(b, c)` pairs; `type` members are dropped
fn named_list(list: &str) -> Vec<(String, String)> {
    list.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty() && !item.starts_with("type "))
        .map(|item| {
            let parts: Vec<&str> = item.split_whitespace().collect();
            match parts.as_slice() {
                [name, "as", alias] => (name.to_string(), alias.to_string()),
                _ => (item.to_string(), item.to_string()),
            }
        })
        .collect()
}

impl EsmToCjsStage {
    pub fn rewrite(source: &str) -> String {
        let mut state = EsmRewrite::default();

        let code = ESM_IMPORT_FROM.replace_all(source, |caps: &Captures| state.import_from(caps));
        let code = ESM_IMPORT_BARE.replace_all(&code, |caps: &Captures| {
            format!("{}require({});", &caps[1], json!(&caps[2]))
        });
        let code = ESM_EXPORT_FROM.replace_all(&code, |caps: &Captures| state.export_from(caps));
        let code = ESM_EXPORT_LIST.replace_all(&code, |caps: &Captures| state.export_list(caps));
        let code = ESM_EXPORT_DEFAULT_DECL
            .replace_all(&code, |caps: &Captures| state.export_declaration(caps, true));
        let mut has_default = false;
        let code = ESM_EXPORT_DEFAULT.replace_all(&code, |caps: &Captures| {
            has_default = true;
            format!("{}exports.default = ", &caps[1])
        });
        let code = ESM_EXPORT_DECL
            .replace_all(&code, |caps: &Captures| state.export_declaration(caps, false));

        if state.exports.is_empty() && !has_default {
            return code.into_owned();
        }

        let mut out = state.header();
        out.push_str(&code);
        out
    }
}

impl TransformStage for EsmToCjsStage {
    fn name(&self) -> &str {
        "esm-to-cjs"
    }

    fn apply(&self, source: &str, _module: &Path) -> Result<StageOutput> {
        Ok(StageOutput::code(Self::rewrite(source)))
    }
}

/// Emits the module file under a content-hashed name and turns the module
/// into its public URL
pub struct FileStage {
    public_url: String,
    hash_length: usize,
    stamp: Option<String>,
}

impl FileStage {
    pub fn new(config: &Config) -> Self {
        Self {
            public_url: config.output.public_url.clone(),
            hash_length: config.output.hash_length,
            stamp: config.build.stamp.clone(),
        }
    }

    fn filename(&self, bytes: &[u8], module: &Path) -> String {
        let stem: String = module
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        let ext = module
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "bin".to_string());
        let hash = hash_content(bytes, self.hash_length);

        match &self.stamp {
            Some(stamp) => format!("{}.{}-{}.{}", stem, hash, stamp, ext),
            None => format!("{}.{}.{}", stem, hash, ext),
        }
    }
}

impl TransformStage for FileStage {
    fn name(&self) -> &str {
        "file"
    }

    fn apply(&self, source: &str, module: &Path) -> Result<StageOutput> {
        self.apply_bytes(source.as_bytes(), module)
    }

    fn apply_bytes(&self, bytes: &[u8], module: &Path) -> Result<StageOutput> {
        let filename = self.filename(bytes, module);
        let url = format!("{}{}", self.public_url, filename);

        Ok(StageOutput {
            code: format!("module.exports = {};", json!(url)),
            files: vec![EmittedFile {
                filename,
                contents: bytes.to_vec(),
            }],
            ..StageOutput::default()
        })
    }
}

/// Turns a JSON document into a module exporting it
pub struct JsonStage;

impl TransformStage for JsonStage {
    fn name(&self) -> &str {
        "json"
    }

    fn apply(&self, source: &str, module: &Path) -> Result<StageOutput> {
        serde_json::from_str::<serde_json::Value>(source)
            .with_context(|| format!("Invalid JSON in {}", module.display()))?;

        Ok(StageOutput::code(format!("module.exports = {};", source.trim())))
    }
}

/// Moves a stylesheet out of the script graph into a `css` side artifact
///
/// `@import` rules become synchronous imports so imported sheets join the
/// same chunk; the module itself becomes an empty script module.
pub struct ExtractCssStage;

impl TransformStage for ExtractCssStage {
    fn name(&self) -> &str {
        "extract-css"
    }

    fn apply(&self, source: &str, _module: &Path) -> Result<StageOutput> {
        let imports = CSS_IMPORT_REGEX
            .captures_iter(source)
            .filter_map(|cap| cap.get(1))
            .map(|m| ImportRef::sync(m.as_str()))
            .collect();

        let stylesheet = CSS_IMPORT_REGEX.replace_all(source, "");
        let stylesheet = stylesheet.trim();

        let assets = if stylesheet.is_empty() {
            Vec::new()
        } else {
            vec![AuxAsset {
                ext: "css".to_string(),
                content: format!("{}\n", stylesheet),
            }]
        };

        Ok(StageOutput {
            code: "module.exports = {};".to_string(),
            imports,
            assets,
            files: Vec::new(),
        })
    }
}

/// Removes simple TypeScript syntax: annotations, interfaces, type aliases
pub struct StripTypesStage;

/// Annotation heads recognised after `: `
const TYPE_HEADS: &[&str] = &[
    "string", "number", "boolean", "any", "void", "never", "unknown", "object", "bigint",
    "symbol", "Array<", "Promise<", "Record<", "Map<", "Set<", "Partial<", "Readonly<",
];

impl StripTypesStage {
    fn strip(source: &str) -> String {
        let mut result = String::with_capacity(source.len());
        let mut chars = source.chars().peekable();
        let mut in_string = false;
        let mut string_char = '"';
        let mut escaped = false;

        while let Some(c) = chars.next() {
            if in_string {
                result.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == string_char {
                    in_string = false;
                }
                continue;
            }

            if c == '"' || c == '\'' || c == '`' {
                in_string = true;
                string_char = c;
                result.push(c);
                continue;
            }

            let at_word_start = !result
                .chars()
                .next_back()
                .map(|p| p.is_alphanumeric() || p == '_' || p == '$')
                .unwrap_or(false);

            // `: type` annotations
            if c == ':' {
                let rest: String = chars.clone().take(16).collect();
                if rest.starts_with(' ') {
                    let trimmed = rest.trim_start();
                    if TYPE_HEADS.iter().any(|head| starts_with_word(trimmed, head)) {
                        let mut depth = 0i32;
                        while let Some(&next) = chars.peek() {
                            if depth == 0 && matches!(next, '=' | ')' | ',' | '{' | ';' | '\n' | ']') {
                                break;
                            }
                            match next {
                                '<' | '(' | '[' => depth += 1,
                                '>' | ')' | ']' => depth -= 1,
                                _ => {}
                            }
                            chars.next();
                        }
                        continue;
                    }
                }
            }

            // `interface Name { ... }`
            if c == 'i' && at_word_start {
                let rest: String = std::iter::once(c).chain(chars.clone().take(9)).collect();
                if rest == "interface " {
                    drop_export_prefix(&mut result);
                    for nc in chars.by_ref() {
                        if nc == '{' {
                            break;
                        }
                    }
                    let mut depth = 1;
                    for bc in chars.by_ref() {
                        match bc {
                            '{' => depth += 1,
                            '}' => depth -= 1,
                            _ => {}
                        }
                        if depth == 0 {
                            break;
                        }
                    }
                    continue;
                }
            }

            // `type Name = ...;`
            if c == 't' && at_word_start {
                let rest: String = std::iter::once(c).chain(chars.clone().take(4)).collect();
                if rest == "type " {
                    drop_export_prefix(&mut result);
                    for nc in chars.by_ref() {
                        if nc == ';' || nc == '\n' {
                            break;
                        }
                    }
                    continue;
                }
            }

            // `expr as Type`, but not `* as ns` or `{ a as b }` in module syntax
            if c == ' ' {
                let rest: String = chars.clone().take(3).collect();
                if rest == "as " && !in_module_statement(&result) {
                    for _ in 0..3 {
                        chars.next();
                    }
                    let mut depth = 0i32;
                    while let Some(&next) = chars.peek() {
                        if depth == 0
                            && (next.is_whitespace() || matches!(next, ',' | ')' | ';' | '}'))
                        {
                            break;
                        }
                        match next {
                            '<' | '(' => depth += 1,
                            '>' | ')' => depth -= 1,
                            _ => {}
                        }
                        chars.next();
                    }
                    continue;
                }
            }

            result.push(c);
        }

        result
    }
}

fn starts_with_word(text: &str, head: &str) -> bool {
    if !text.starts_with(head) {
        return false;
    }
    if head.ends_with('<') {
        return true;
    }
    !text[head.len()..]
        .chars()
        .next()
        .map(|c| c.is_alphanumeric() || c == '_')
        .unwrap_or(false)
}

fn drop_export_prefix(result: &mut String) {
    let is_blank = |c: char| c == ' ' || c == '\t';
    let trimmed_len = result.trim_end_matches(is_blank).len();
    if result[..trimmed_len].ends_with("export") {
        let line_start = result[..trimmed_len - "export".len()].trim_end_matches(is_blank).len();
        result.truncate(line_start);
    }
}

fn in_module_statement(result: &str) -> bool {
    let line = result.rsplit('\n').next().unwrap_or("").trim_start();
    line.starts_with("import") || line.starts_with("export")
}

impl TransformStage for StripTypesStage {
    fn name(&self) -> &str {
        "strip-types"
    }

    fn apply(&self, source: &str, _module: &Path) -> Result<StageOutput> {
        Ok(StageOutput::code(Self::strip(source)))
    }
}
