//! Annotation processor resolution.
//!
//! Nodes declare processors by class name. Every class is registered against
//! a base directory, and the concrete artifact is whichever dependency of the
//! node lives under that directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::core::{Hash32, Root, split_root};
use crate::error::PatchError;
use crate::graph::Graph;
use crate::patch::{Diagnostic, PatchOutcome};
use crate::target::semantic::Annotation;

static VERSIONED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.\d]+.*$").expect("valid version pattern"));

/// Processor class to base directory, relative to the build root.
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    class_to_base: BTreeMap<String, String>,
}

impl ProcessorRegistry {
    /// Reads the registry from a JSON object file. A missing or malformed file
    /// is fatal.
    pub fn load(path: &Utf8Path) -> Result<Self, PatchError> {
        let resource = |source: anyhow::Error| PatchError::Resource {
            path: path.to_owned(),
            source,
        };

        let bytes = std::fs::read(path).map_err(|e| resource(e.into()))?;
        let class_to_base = serde_json::from_slice(&bytes).map_err(|e| resource(e.into()))?;

        Ok(Self { class_to_base })
    }

    pub fn base_of(&self, class: &str) -> Option<&str> {
        self.class_to_base.get(class).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.class_to_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_to_base.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProcessorRegistry {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            class_to_base: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Whether the directory holding `path` is named like a version (`1.2.3`).
pub fn has_version(path: &str) -> bool {
    Utf8Path::new(path)
        .parent()
        .and_then(Utf8Path::file_name)
        .is_some_and(|name| VERSIONED.is_match(name))
}

/// Output path relative to the build root.
fn build_relative(output: &str) -> &str {
    match split_root(output) {
        (Some(Root::Build), rest) => rest,
        _ => output.strip_prefix("$B/").unwrap_or(output),
    }
}

pub(crate) fn patch_processors(graph: &mut Graph, registry: &ProcessorRegistry, outcome: &mut PatchOutcome) {
    let positions: HashMap<Hash32, usize> = graph.positions();
    let mut rewrites = Vec::new();

    for (i, node) in graph.graph.iter().enumerate() {
        let needs_patch = node
            .semantics
            .iter()
            .any(|a| matches!(a, Annotation::ProcessorClasses(_)));
        if !needs_patch {
            continue;
        }

        let dep_paths: Vec<Utf8PathBuf> = node
            .deps
            .iter()
            .filter_map(|uid| positions.get(uid))
            .flat_map(|&j| graph.graph[j].outputs.iter())
            .map(|output| Utf8PathBuf::from(build_relative(output)))
            .collect();

        let semantics: Vec<Annotation> = node
            .semantics
            .iter()
            .map(|annotation| match annotation {
                Annotation::ProcessorClasses(classes) => {
                    let mut paths = Vec::new();

                    for class in classes {
                        let Some(base) = registry.base_of(class) else {
                            outcome.diagnose(Diagnostic::new(node, format!("No path registered for processor class {class}")));
                            continue;
                        };

                        // one class may resolve to several builds of the same processor
                        let matches: Vec<&Utf8PathBuf> = dep_paths.iter().filter(|dep| dep.starts_with(base)).collect();
                        if matches.is_empty() {
                            outcome.diagnose(Diagnostic::new(
                                node,
                                format!("Processor {class} under {base} is not among the dependencies of the node, skipped"),
                            ));
                            continue;
                        }

                        for dep in matches {
                            if !paths.contains(&dep.to_string()) {
                                paths.push(dep.to_string());
                            }
                            outcome
                                .processors_used
                                .entry(class.clone())
                                .or_default()
                                .insert(dep.to_string());
                        }
                    }

                    Annotation::Processors(paths)
                }
                other => other.clone(),
            })
            .collect();

        rewrites.push((i, semantics));
    }

    for (i, semantics) in rewrites {
        graph.graph[i].semantics = semantics;
        outcome.patched = true;
    }

    if !outcome.processors_used.is_empty() {
        let summary: Vec<String> = outcome
            .processors_used
            .iter()
            .map(|(class, paths)| format!("{class} --> {}", paths.iter().cloned().collect::<Vec<_>>().join(", ")))
            .collect();
        tracing::info!("annotation processors patched in graph:\n{}", summary.join("\n"));
    }

    for node in &graph.graph {
        for annotation in &node.semantics {
            if let Annotation::Processors(paths) = annotation {
                for path in paths.iter().filter(|path| !has_version(path)) {
                    outcome.diagnose(Diagnostic::new(
                        node,
                        format!("Annotation processor without version: {path}"),
                    ));
                }
            }
        }
    }
}
