//! Second pass over an assembled graph, filling in what only the whole graph
//! can tell: concrete annotation processor paths and toolchain locations.
//!
//! The pass is idempotent. Running it on an already patched graph rewrites
//! nothing and reports `patched == false`.

pub mod processors;
pub mod toolchain;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

use camino::Utf8Path;

use crate::config::PatchOptions;
use crate::core::{Hash32, normalize_target};
use crate::error::PatchError;
use crate::graph::{Graph, GraphNode};
use crate::utils::as_overhead;

pub use processors::ProcessorRegistry;
pub use toolchain::{DirToolchains, ToolchainCache, ToolchainProvider};

/// A node-scoped problem that did not stop the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub node: Hash32,
    pub target: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(node: &GraphNode, message: impl Into<String>) -> Self {
        Self {
            node: node.uid,
            target: node.target.clone(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PatchOutcome {
    /// Whether the graph changed and has to be written back.
    pub patched: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Toolchains missing for requested targets.
    pub errors: Vec<PatchError>,
    /// Every processor class with the concrete paths it resolved to.
    pub processors_used: BTreeMap<String, BTreeSet<String>>,
}

impl PatchOutcome {
    pub(crate) fn diagnose(&mut self, diagnostic: Diagnostic) {
        tracing::error!(target_path = %diagnostic.target, node = %diagnostic.node, "{}", diagnostic.message);
        if !self.diagnostics.contains(&diagnostic) {
            self.diagnostics.push(diagnostic);
        }
    }

    /// Fails with the first hard error, if any.
    pub fn check(mut self) -> Result<Self, PatchError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(self.errors.remove(0))
        }
    }
}

pub struct Patcher {
    registry: ProcessorRegistry,
    toolchains: ToolchainCache,
    provider: Box<dyn ToolchainProvider>,
    requested: HashSet<String>,
}

impl Patcher {
    /// Reads the processor registry if one is configured; an unreadable
    /// registry is fatal.
    pub fn new(options: &PatchOptions) -> Result<Self, PatchError> {
        let registry = match &options.processors_file {
            Some(path) => ProcessorRegistry::load(path)?,
            None => ProcessorRegistry::default(),
        };

        Ok(Self {
            registry,
            toolchains: ToolchainCache::new(&options.toolchain_cache_dir),
            provider: Box::new(DirToolchains::new(
                &options.toolchain_root,
                &options.toolchain_prefix,
            )),
            requested: HashSet::new(),
        })
    }

    pub fn with_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_provider(mut self, provider: impl ToolchainProvider + 'static) -> Self {
        self.provider = Box::new(provider);
        self
    }

    /// Limits real toolchain resolution to the given target. Without any
    /// request every target is resolved.
    pub fn request(mut self, path: impl AsRef<str>) -> Self {
        self.requested.insert(normalize_target(path.as_ref()));
        self
    }

    pub fn apply(&mut self, graph: &mut Graph) -> PatchOutcome {
        let s = Instant::now();
        let mut outcome = PatchOutcome::default();

        processors::patch_processors(graph, &self.registry, &mut outcome);

        let requested = &self.requested;
        toolchain::patch_toolchains(
            graph,
            &mut self.toolchains,
            self.provider.as_ref(),
            |target| requested.is_empty() || requested.contains(target),
            &mut outcome,
        );

        tracing::info!(
            patched = outcome.patched,
            diagnostics = outcome.diagnostics.len(),
            errors = outcome.errors.len(),
            "semantic patch pass finished {}",
            as_overhead(s)
        );

        outcome
    }

    /// Patches a serialized graph in place, touching the file only when
    /// something changed.
    pub fn patch_file(&mut self, path: &Utf8Path) -> Result<PatchOutcome, PatchError> {
        let bytes = std::fs::read(path)?;
        let mut graph: Graph = serde_json::from_slice(&bytes)?;

        let outcome = self.apply(&mut graph);
        if outcome.patched {
            std::fs::write(path, serde_json::to_vec_pretty(&graph)?)?;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::bail;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::error::CallbackResult;
    use crate::graph::Cmd;
    use crate::target::semantic::{Annotation, Toolchain};

    fn node(name: &str, target: &str, outputs: &[&str], deps: Vec<Hash32>, semantics: Vec<Annotation>) -> GraphNode {
        GraphNode {
            uid: Hash32::hash(name),
            target: target.into(),
            inputs: vec![],
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            deps,
            cmds: vec![Cmd::new([name])],
            kv: BTreeMap::new(),
            semantics,
            result: false,
        }
    }

    fn graph() -> Graph {
        let lombok = node("lombok", "contrib/lombok", &["$(BUILD_ROOT)/contrib/lombok/1.18.30/lombok.jar"], vec![], vec![]);
        let mapstruct = node("mapstruct", "contrib/mapstruct", &["$(BUILD_ROOT)/contrib/mapstruct/mapstruct.jar"], vec![], vec![]);
        let app = node(
            "app",
            "app",
            &["$(BUILD_ROOT)/app/app.jar"],
            vec![lombok.uid, mapstruct.uid],
            vec![
                Annotation::ProcessorClasses(vec!["lombok.Processor".into(), "org.mapstruct.Processor".into(), "ghost.Processor".into()]),
                Annotation::ToolchainVersion("JDK17_RESOURCE".into()),
                Annotation::ToolchainPath(Toolchain::Symbolic("$(JDK17_RESOURCE_GLOBAL)".into())),
            ],
        );
        let other = node(
            "other",
            "other",
            &["$(BUILD_ROOT)/other/other.jar"],
            vec![],
            vec![Annotation::ToolchainPath(Toolchain::Symbolic("$(JDK11_RESOURCE_GLOBAL)".into()))],
        );

        Graph {
            result: [app.uid].into(),
            graph: vec![lombok, mapstruct, app, other],
        }
    }

    fn patcher(links: &Utf8Path, real: Utf8PathBuf) -> Patcher {
        Patcher::new(&PatchOptions::default().with_toolchain_cache_dir(links))
            .unwrap()
            .with_registry(ProcessorRegistry::from_iter([
                ("lombok.Processor", "contrib/lombok"),
                ("org.mapstruct.Processor", "contrib/mapstruct"),
            ]))
            .with_provider(move |version: u32| -> CallbackResult<Utf8PathBuf> {
                if version == 17 { Ok(real.clone()) } else { bail!("no jdk {version}") }
            })
            .request("app")
    }

    #[test]
    fn test_apply_rewrites_semantics() {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(base.join("jdk17")).unwrap();

        let mut graph = graph();
        let outcome = patcher(&base.join("links"), base.join("jdk17")).apply(&mut graph);

        assert!(outcome.patched);
        assert!(outcome.errors.is_empty());

        let app = &graph.graph[2];
        assert_eq!(
            app.semantics[0],
            Annotation::Processors(vec![
                "contrib/lombok/1.18.30/lombok.jar".into(),
                "contrib/mapstruct/mapstruct.jar".into(),
            ])
        );
        assert_eq!(app.semantics[1], Annotation::ToolchainVersion("17".into()));
        assert!(matches!(&app.semantics[2], Annotation::ToolchainPath(Toolchain::Resolved(p)) if p != "NOT_FOUND"));
        assert_eq!(
            graph.graph[3].semantics[0],
            Annotation::ToolchainPath(Toolchain::Resolved("JDK_PATH_11".into()))
        );

        // unknown class and unversioned mapstruct
        assert_eq!(outcome.diagnostics.len(), 2);
        assert_eq!(outcome.processors_used["lombok.Processor"].len(), 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(base.join("jdk17")).unwrap();

        let mut patcher = patcher(&base.join("links"), base.join("jdk17"));
        let mut graph = graph();
        patcher.apply(&mut graph);
        let once = serde_json::to_vec(&graph).unwrap();

        let outcome = patcher.apply(&mut graph);
        assert!(!outcome.patched);
        assert_eq!(serde_json::to_vec(&graph).unwrap(), once);
    }

    #[test]
    fn test_missing_toolchain_is_hard_error_for_requested_only() {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

        let mut graph = graph();
        let outcome = patcher(&base.join("links"), base.join("absent"))
            .request("other")
            .apply(&mut graph);

        assert_eq!(
            graph.graph[3].semantics[0],
            Annotation::ToolchainPath(Toolchain::Resolved("NOT_FOUND".into()))
        );
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.check().is_err());
    }

    #[test]
    fn test_patch_file_leaves_clean_graph_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(base.join("jdk17")).unwrap();
        let path = base.join("graph.json");

        let mut patcher = patcher(&base.join("links"), base.join("jdk17"));
        graph().write(&path).unwrap();

        assert!(patcher.patch_file(&path).unwrap().patched);
        let once = std::fs::read(&path).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert!(!patcher.patch_file(&path).unwrap().patched);
        assert_eq!(std::fs::read(&path).unwrap(), once);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn test_patch_file_twice_with_relative_cache_dir() {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let real = base.join("jdk17");
        std::fs::create_dir_all(&real).unwrap();
        let path = base.join("graph.json");

        // relative like the default, but unique per run
        let links = Utf8PathBuf::from(format!(
            "target/forge-links-{}",
            temp.path().file_name().unwrap().to_string_lossy()
        ));
        assert!(links.is_relative());
        let mut patcher = patcher(&links, real);
        graph().write(&path).unwrap();

        let first = patcher.patch_file(&path).unwrap();
        assert!(first.patched);
        assert!(first.errors.is_empty());
        let once = std::fs::read(&path).unwrap();

        let graph: Graph = serde_json::from_slice(&once).unwrap();
        match &graph.graph[2].semantics[2] {
            Annotation::ToolchainPath(Toolchain::Resolved(p)) => assert!(Utf8Path::new(p).is_absolute()),
            other => panic!("unexpected {other:?}"),
        }

        let mut fresh = self::patcher(&links, base.join("jdk17"));
        let second = fresh.patch_file(&path).unwrap();
        assert!(!second.patched);
        assert!(second.errors.is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), once);

        let _ = std::fs::remove_dir_all(&links);
    }
}
