//! The target index: an immutable lookup from normalized target path to the
//! target's declared outputs, dependencies and annotations.

pub mod semantic;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::{dirname, normalize_target};
use crate::error::UnknownTargetError;
use crate::target::semantic::Annotation;

/// Flavor assumed for classpath jars that do not declare one.
pub const DEFAULT_CLASSPATH_FLAVOR: &str = "cls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    ClasspathJar,
    SharedLibrary,
    #[serde(other)]
    Other,
}

/// One declared output of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    /// Classpath flavor (`cls`, `src`, ...). Only meaningful for jars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
}

impl OutputArtifact {
    pub fn provides(&self, capability: &Capability) -> bool {
        match (capability, self.kind) {
            (Capability::Classpath(flavor), ArtifactKind::ClasspathJar) => {
                self.flavor.as_deref().unwrap_or(DEFAULT_CLASSPATH_FLAVOR) == flavor
            }
            (Capability::SharedLibrary, ArtifactKind::SharedLibrary) => true,
            _ => false,
        }
    }
}

/// An output capability a consumer can ask its dependencies for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    /// A classpath jar of the given flavor.
    Classpath(String),
    SharedLibrary,
}

impl Capability {
    pub fn classpath() -> Self {
        Capability::Classpath(DEFAULT_CLASSPATH_FLAVOR.to_string())
    }
}

/// One declared build unit as reported by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub path: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<OutputArtifact>,
    #[serde(default)]
    pub semantics: Vec<Annotation>,
}

impl TargetDescriptor {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_target(path.as_ref()),
            deps: Vec::new(),
            outputs: Vec::new(),
            semantics: Vec::new(),
        }
    }

    pub fn with_dep(mut self, dep: impl AsRef<str>) -> Self {
        self.deps.push(normalize_target(dep.as_ref()));
        self
    }

    pub fn with_output(mut self, output: OutputArtifact) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_semantic(mut self, annotation: Annotation) -> Self {
        self.semantics.push(annotation);
        self
    }

    pub fn provides(&self, capability: &Capability) -> bool {
        self.artifact(capability).is_some()
    }

    pub fn artifact(&self, capability: &Capability) -> Option<&OutputArtifact> {
        self.outputs.iter().find(|output| output.provides(capability))
    }

    /// File name of the first classpath jar, if the target produces one.
    pub fn output_jar_name(&self) -> Option<&str> {
        self.outputs
            .iter()
            .find(|output| output.kind == ArtifactKind::ClasspathJar)
            .map(|output| output.path.rsplit('/').next().unwrap_or(&output.path))
    }

    pub fn bundle_name(&self) -> Option<&str> {
        self.semantics.iter().find_map(|annotation| match annotation {
            Annotation::BundleName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn disables_cache(&self) -> bool {
        self.semantics.iter().any(|annotation| match annotation {
            Annotation::DisableCache(value) => Annotation::is_truthy(value),
            _ => false,
        })
    }

    fn normalized(mut self) -> Self {
        self.path = normalize_target(&self.path);
        self.deps = self.deps.iter().map(|dep| normalize_target(dep)).collect();
        self
    }
}

/// Immutable query surface over all targets of one build invocation.
///
/// Safe to share between threads without locking.
#[derive(Debug, Default, Clone)]
pub struct TargetIndex {
    by_path: BTreeMap<String, TargetDescriptor>,
}

impl TargetIndex {
    pub fn new(targets: impl IntoIterator<Item = TargetDescriptor>) -> Self {
        let mut by_path = BTreeMap::new();

        for target in targets {
            let target = target.normalized();
            if by_path.contains_key(&target.path) {
                tracing::warn!(path = %target.path, "duplicate target descriptor, keeping the first one");
                continue;
            }
            by_path.insert(target.path.clone(), target);
        }

        Self { by_path }
    }

    pub fn resolve(&self, path: &str) -> Result<&TargetDescriptor, UnknownTargetError> {
        let key = normalize_target(path);
        self.by_path.get(&key).ok_or(UnknownTargetError(key))
    }

    pub fn get(&self, path: &str) -> Option<&TargetDescriptor> {
        self.resolve(path).ok()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(&normalize_target(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDescriptor> {
        self.by_path.values()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// A proxy re-exports its single dependency living one directory below it.
    pub fn is_proxy(&self, target: &TargetDescriptor) -> bool {
        matches!(target.deps.as_slice(), [dep] if dirname(dep) == target.path)
    }

    /// Dependencies of `path` exposing `capability`, looking through proxies so
    /// that the real producer is returned instead of the re-exporting target.
    pub fn dependents_providing(
        &self,
        path: &str,
        capability: &Capability,
    ) -> Result<Vec<&TargetDescriptor>, UnknownTargetError> {
        let target = self.resolve(path)?;
        let mut chosen = Vec::new();

        for dep in &target.deps {
            let mut current = self.resolve(dep)?;
            let mut seen = HashSet::new();

            while self.is_proxy(current) {
                if !seen.insert(current.path.as_str()) {
                    break;
                }
                current = self.resolve(&current.deps[0])?;
            }

            if current.provides(capability) && !chosen.iter().any(|t: &&TargetDescriptor| t.path == current.path) {
                chosen.push(current);
            }
        }

        Ok(chosen)
    }

    /// Artifact paths of the classpath jars of the given flavor among the
    /// dependencies of `path`.
    pub fn classpath(&self, path: &str, flavor: &str) -> Result<Vec<&str>, UnknownTargetError> {
        let capability = Capability::Classpath(flavor.to_string());
        Ok(self
            .dependents_providing(path, &capability)?
            .into_iter()
            .filter_map(|target| target.artifact(&capability))
            .map(|artifact| artifact.path.as_str())
            .collect())
    }

    pub fn shared_libraries(&self, path: &str) -> Result<Vec<&str>, UnknownTargetError> {
        Ok(self
            .dependents_providing(path, &Capability::SharedLibrary)?
            .into_iter()
            .filter_map(|target| target.artifact(&Capability::SharedLibrary))
            .map(|artifact| artifact.path.as_str())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jar(path: &str) -> OutputArtifact {
        OutputArtifact {
            path: path.into(),
            kind: ArtifactKind::ClasspathJar,
            flavor: None,
        }
    }

    fn dll(path: &str) -> OutputArtifact {
        OutputArtifact {
            path: path.into(),
            kind: ArtifactKind::SharedLibrary,
            flavor: None,
        }
    }

    fn index() -> TargetIndex {
        TargetIndex::new([
            TargetDescriptor::new("app")
                .with_dep("lib/a")
                .with_dep("contrib/guava")
                .with_dep("native/z"),
            TargetDescriptor::new("lib/a").with_output(jar("lib/a/a.jar")),
            TargetDescriptor::new("contrib/guava").with_dep("contrib/guava/impl"),
            TargetDescriptor::new("contrib/guava/impl").with_output(jar("contrib/guava/impl/guava.jar")),
            TargetDescriptor::new("native/z").with_output(dll("native/z/libz.so")),
        ])
    }

    #[test]
    fn test_resolve_normalizes() {
        let index = index();
        assert_eq!(index.resolve("./lib/a/").unwrap().path, "lib/a");
        assert_eq!(
            index.resolve("missing").unwrap_err(),
            UnknownTargetError("missing".into())
        );
    }

    #[test]
    fn test_proxy_is_skipped() {
        let index = index();
        let found: Vec<_> = index
            .dependents_providing("app", &Capability::classpath())
            .unwrap()
            .into_iter()
            .map(|t| t.path.as_str())
            .collect();

        assert_eq!(found, vec!["lib/a", "contrib/guava/impl"]);
        assert!(index.is_proxy(index.resolve("contrib/guava").unwrap()));
        assert!(!index.is_proxy(index.resolve("app").unwrap()));
    }

    #[test]
    fn test_shared_proxy_chain_reaches_producer() {
        let index = TargetIndex::new([
            TargetDescriptor::new("app")
                .with_dep("contrib/x")
                .with_dep("contrib/x/y"),
            TargetDescriptor::new("lib").with_dep("contrib/x/y"),
            TargetDescriptor::new("contrib/x").with_dep("contrib/x/y"),
            TargetDescriptor::new("contrib/x/y").with_dep("contrib/x/y/z"),
            TargetDescriptor::new("contrib/x/y/z").with_output(jar("contrib/x/y/z/z.jar")),
        ]);

        for path in ["app", "lib"] {
            let found: Vec<_> = index
                .dependents_providing(path, &Capability::classpath())
                .unwrap()
                .into_iter()
                .map(|t| t.path.as_str())
                .collect();
            assert_eq!(found, vec!["contrib/x/y/z"]);
        }
    }

    #[test]
    fn test_capabilities() {
        let index = index();
        assert_eq!(index.shared_libraries("app").unwrap(), vec!["native/z/libz.so"]);
        assert_eq!(
            index.classpath("app", "cls").unwrap(),
            vec!["lib/a/a.jar", "contrib/guava/impl/guava.jar"]
        );
        assert!(index.classpath("app", "src").unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "path": "lib/b/",
            "deps": ["lib/a"],
            "outputs": [{"path": "lib/b/b.jar", "type": "classpath-jar"}, {"path": "x", "type": "weird"}],
            "semantics": [["bundle-name", "b-bundle"], ["vcs-info-disable-cache", "yes"]]
        }"#;
        let target: TargetDescriptor = serde_json::from_str(json).unwrap();
        let index = TargetIndex::new([target]);
        let target = index.resolve("lib/b").unwrap();

        assert_eq!(target.outputs[1].kind, ArtifactKind::Other);
        assert_eq!(target.bundle_name(), Some("b-bundle"));
        assert!(target.disables_cache());
        assert_eq!(target.output_jar_name(), Some("b.jar"));
    }
}
