//! Module loader and chunk linking
//!
//! Chunks register their modules by pushing onto a global queue; the runtime
//! chunk installs them, runs entry modules and loads async chunks on demand.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;

use super::chunk::{ChunkGraph, ChunkId, ChunkKind};
use super::graph::{ImportKind, ModuleGraph};
use crate::utils::relative_path;

/// Global queue shared between chunks and the runtime
const QUEUE: &str = "__hashpack";

static DYNAMIC_IMPORT_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\w.$])import\s*\(").expect("static regex"));

/// What the runtime needs to load one async or dependency chunk
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChunkLocation {
    pub js: Option<String>,
    pub css: Vec<String>,
    pub deps: Vec<String>,
}

/// Link a chunk into its script source
///
/// Every module becomes a factory under its key, paired with a map from each
/// specifier it uses to the key it resolved to. Deferred specifiers map to
/// `[key, chunk]`, or `[key, null]` when no chunk needs loading.
pub fn link_chunk(graph: &ModuleGraph, chunks: &ChunkGraph, id: ChunkId, root: &Path) -> String {
    let chunk = chunks.chunk(id);
    let mut out = String::new();

    out.push_str(&format!(
        "(self.{q} = self.{q} || []).push([{name}, {{\n",
        q = QUEUE,
        name = json!(chunk.name)
    ));

    for (index, &module_id) in chunk.modules.iter().enumerate() {
        let Some(module) = graph.get_module(module_id) else {
            continue;
        };

        let mut map = serde_json::Map::new();
        let mut has_deferred = false;
        for dep in graph.dependencies(module_id) {
            let Some(target) = graph.get_module(dep.to) else {
                continue;
            };
            let value = match dep.kind {
                ImportKind::Sync => json!(target.key),
                ImportKind::Deferred => {
                    has_deferred = true;
                    let chunk_name = chunks
                        .async_chunk_for(dep.to)
                        .map(|c| chunks.chunk(c).name.clone());
                    json!([target.key, chunk_name])
                }
            };
            map.insert(dep.specifier.clone(), value);
        }

        let code = if has_deferred {
            DYNAMIC_IMPORT_CALL
                .replace_all(&module.transformed, "${1}require.lazy(")
                .into_owned()
        } else {
            module.transformed.clone()
        };

        let label = relative_path(root, &module.path).unwrap_or_else(|| module.key.clone());
        out.push_str(&format!(
            "/* {} */\n{}: [function (module, exports, require) {{\n{}\n}}, {}]{}\n",
            label,
            json!(module.key),
            code.trim_end(),
            serde_json::Value::Object(map),
            if index + 1 < chunk.modules.len() { "," } else { "" }
        ));
    }

    out.push('}');

    if chunk.kind.is_root() {
        if let Some(entry) = chunk.root.and_then(|m| graph.get_module(m)) {
            // Async roots run on demand through require.lazy
            if chunk.kind == ChunkKind::Entry {
                out.push_str(&format!(", {}", json!(entry.key)));
            }
        }
    }

    out.push_str("]);\n");
    out
}

/// Render the runtime chunk with the async chunk map and public URL
pub fn render_runtime(locations: &BTreeMap<String, ChunkLocation>, public_url: &str) -> String {
    let map = serde_json::to_string(locations).unwrap_or_else(|_| "{}".to_string());
    RUNTIME_TEMPLATE
        .replace("__QUEUE__", QUEUE)
        .replace("__CHUNK_MAP__", &map)
        .replace("__PUBLIC_URL__", &json!(public_url).to_string())
}

const RUNTIME_TEMPLATE: &str = r#"(function (global) {
  var modules = {};
  var cache = {};
  var installed = {};
  var pending = {};
  var chunkMap = __CHUNK_MAP__;
  var publicUrl = __PUBLIC_URL__;

  function load(key) {
    if (cache[key]) return cache[key].exports;
    var def = modules[key];
    if (!def) throw new Error("hashpack: module " + key + " is not loaded");
    var module = (cache[key] = { exports: {} });
    def[0].call(module.exports, module, module.exports, scopedRequire(def[1]));
    return module.exports;
  }

  function scopedRequire(map) {
    function target(specifier) {
      var t = map[specifier];
      if (t === undefined) throw new Error("hashpack: cannot find module '" + specifier + "'");
      return typeof t === "string" ? [t, null] : t;
    }
    function require(specifier) {
      return load(target(specifier)[0]);
    }
    require.lazy = function (specifier) {
      var t;
      try { t = target(specifier); } catch (e) { return Promise.reject(e); }
      return loadChunk(t[1]).then(function () { return load(t[0]); });
    };
    return require;
  }

  function loadChunk(name) {
    if (!name || installed[name]) return Promise.resolve();
    if (pending[name]) return pending[name];
    var info = chunkMap[name];
    if (!info) return Promise.reject(new Error("hashpack: unknown chunk " + name));
    pending[name] = Promise.all(info.deps.map(loadChunk)).then(function () {
      info.css.forEach(function (file) {
        var link = document.createElement("link");
        link.rel = "stylesheet";
        link.href = publicUrl + file;
        document.head.appendChild(link);
      });
      if (!info.js) { installed[name] = true; return; }
      return new Promise(function (resolve, reject) {
        var script = document.createElement("script");
        script.src = publicUrl + info.js;
        script.onload = function () { resolve(); };
        script.onerror = function () {
          delete pending[name];
          reject(new Error("hashpack: failed to load chunk " + name));
        };
        document.head.appendChild(script);
      });
    });
    return pending[name];
  }

  function install(chunk) {
    var defs = chunk[1];
    for (var key in defs) {
      if (Object.prototype.hasOwnProperty.call(defs, key)) modules[key] = defs[key];
    }
    installed[chunk[0]] = true;
    if (chunk[2]) load(chunk[2]);
  }

  var queue = (global.__QUEUE__ = global.__QUEUE__ || []);
  for (var i = 0; i < queue.length; i++) install(queue[i]);
  queue.push = install;
})(typeof self !== "undefined" ? self : this);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::chunk::ChunkPlanner;
    use crate::bundler::graph::tests::{edge, module};
    use crate::config::Config;

    fn keyed(path: &str, key: &str, code: &str) -> crate::bundler::Module {
        let mut m = module(path);
        m.key = key.to_string();
        m.transformed = code.to_string();
        m
    }

    #[test]
    fn test_entry_chunk_runs_entry_and_maps_specifiers() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(keyed(
            "/p/src/index.js",
            "k0",
            "require('./a');\nimport('./page').then(function (p) { p.show(); });",
        ));
        let a = graph.add_module(keyed("/p/src/a.js", "k1", "module.exports = 1;"));
        let page = graph.add_module(keyed("/p/src/page.js", "k2", "exports.show = 1;"));
        graph.add_dependency(crate::bundler::Dependency {
            specifier: "./a".into(),
            ..edge(index, a, ImportKind::Sync)
        });
        graph.add_dependency(crate::bundler::Dependency {
            specifier: "./page".into(),
            ..edge(index, page, ImportKind::Deferred)
        });
        graph.add_entry("main".into(), index);

        let config = Config::default_config("/p");
        let chunks = ChunkPlanner::new(&config).unwrap().plan(&graph);
        let (main, _) = chunks.entry_chunks().next().unwrap();

        let code = link_chunk(&graph, &chunks, main, Path::new("/p"));
        assert!(code.starts_with("(self.__hashpack = self.__hashpack || []).push([\"main\", {"));
        assert!(code.contains("/* src/index.js */"));
        assert!(code.contains(r#"{"./a":"k1","./page":["k2","page"]}"#));
        assert!(code.contains("require.lazy('./page')"));
        assert!(code.trim_end().ends_with("}, \"k0\"]);"));

        let async_chunk = chunks.async_chunk_for(page).unwrap();
        let code = link_chunk(&graph, &chunks, async_chunk, Path::new("/p"));
        assert!(code.contains("\"k2\": [function"));
        assert!(code.trim_end().ends_with("}]);"));
    }

    #[test]
    fn test_runtime_embeds_chunk_map() {
        let mut locations = BTreeMap::new();
        locations.insert(
            "page".to_string(),
            ChunkLocation {
                js: Some("page.1234abcd.js".into()),
                css: vec!["page.99aa00bb.css".into()],
                deps: vec!["common".into()],
            },
        );

        let runtime = render_runtime(&locations, "/static/");
        assert!(runtime.contains(
            r#"var chunkMap = {"page":{"js":"page.1234abcd.js","css":["page.99aa00bb.css"],"deps":["common"]}};"#
        ));
        assert!(runtime.contains(r#"var publicUrl = "/static/";"#));
        assert!(runtime.contains("global.__hashpack = global.__hashpack || []"));
        assert!(!runtime.contains("__CHUNK_MAP__"));
    }
}
