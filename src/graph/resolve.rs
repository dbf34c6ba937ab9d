//! Input resolution against the source and build trees.

use std::collections::HashSet;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Blake3Hasher, Hash32, Root, split_root};

/// How an existing input contributes to node identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    /// BLAKE3 of the file contents.
    #[default]
    Content,
    /// Path and modification time, cheaper but coarser.
    Mtime,
}

impl Identity {
    pub fn policy(self) -> Box<dyn IdentityPolicy> {
        match self {
            Identity::Content => Box::new(ContentHash),
            Identity::Mtime => Box::new(PathMtime),
        }
    }
}

/// Computes the identity digest of an input that exists on disk.
pub trait IdentityPolicy: Send + Sync {
    fn identify(&self, path: &Utf8Path) -> std::io::Result<Hash32>;
}

pub struct ContentHash;

impl IdentityPolicy for ContentHash {
    fn identify(&self, path: &Utf8Path) -> std::io::Result<Hash32> {
        if !path.is_dir() {
            return Hash32::hash_file(path);
        }

        // directories are identified by their listing
        let mut names = path
            .read_dir_utf8()?
            .map(|entry| entry.map(|e| e.file_name().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        names.sort();

        let mut hasher = Blake3Hasher::default();
        for name in &names {
            hasher.field(name);
        }
        Ok(hasher.finish32())
    }
}

pub struct PathMtime;

impl IdentityPolicy for PathMtime {
    fn identify(&self, path: &Utf8Path) -> std::io::Result<Hash32> {
        let modified = path.metadata()?.modified()?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        let mut hasher = Blake3Hasher::default();
        hasher.field(path.as_str()).field(nanos.to_le_bytes());
        Ok(hasher.finish32())
    }
}

/// Outcome of resolving one declared input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exists on disk, with its identity digest.
    Found(Hash32),
    /// Produced by another node of the graph.
    Produced,
    /// Not found; every name under which it should be reported.
    Missing(Vec<String>),
}

impl Resolution {
    /// The string this input contributes to its node's UID.
    pub fn fingerprint(&self, input: &str) -> String {
        match self {
            Resolution::Found(hash) => format!("{input}\0{hash}"),
            Resolution::Produced => format!("{input}\0produced"),
            Resolution::Missing(_) => format!("{input}\0missing"),
        }
    }
}

pub struct InputResolver<'a> {
    source: &'a Utf8Path,
    build: &'a Utf8Path,
    produced: &'a HashSet<&'a str>,
    policy: &'a dyn IdentityPolicy,
}

impl<'a> InputResolver<'a> {
    pub fn new(
        source: &'a Utf8Path,
        build: &'a Utf8Path,
        produced: &'a HashSet<&'a str>,
        policy: &'a dyn IdentityPolicy,
    ) -> Self {
        Self {
            source,
            build,
            produced,
            policy,
        }
    }

    /// Resolves `input` declared by a node of `target`.
    ///
    /// Inputs without a root prefix are looked up relative to the source root,
    /// then relative to the target directory; when both fail both names are
    /// reported.
    pub fn resolve(&self, target: &str, input: &str) -> Resolution {
        if self.produced.contains(input) {
            return Resolution::Produced;
        }

        match split_root(input) {
            (Some(Root::Source), rest) => self.probe(self.source.join(rest), input),
            (Some(Root::Build), rest) => self.probe(self.build.join(rest), input),
            (None, rest) => {
                let nested = if target.is_empty() {
                    rest.to_string()
                } else {
                    format!("{target}/{rest}")
                };

                match self.probe(self.source.join(rest), input) {
                    Resolution::Missing(_) => match self.probe(self.source.join(&nested), input) {
                        Resolution::Missing(_) => {
                            let mut names = vec![input.to_string(), nested];
                            names.dedup();
                            Resolution::Missing(names)
                        }
                        found => found,
                    },
                    found => found,
                }
            }
        }
    }

    /// Resolves every `(target, input)` pair on the rayon pool.
    pub fn resolve_all(&self, requests: &[(&str, &str)]) -> Vec<Resolution> {
        let span = tracing::span!(Level::INFO, "resolving_inputs");
        span.pb_set_length(requests.len() as u64);
        span.pb_set_style(&crate::utils::style_bar());
        span.pb_set_message("Resolving inputs...");
        let _enter = span.enter();

        requests
            .par_iter()
            .map(|(target, input)| {
                let resolution = self.resolve(target, input);
                span.pb_inc(1);
                resolution
            })
            .collect()
    }

    fn probe(&self, path: Utf8PathBuf, input: &str) -> Resolution {
        if !path.exists() {
            return Resolution::Missing(vec![input.to_string()]);
        }

        match self.policy.identify(&path) {
            Ok(hash) => Resolution::Found(hash),
            Err(err) => {
                tracing::warn!(%path, %err, "input exists but could not be identified");
                Resolution::Missing(vec![input.to_string()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> (tempfile::TempDir, Utf8PathBuf, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = base.join("src");
        let build = base.join("build");
        std::fs::create_dir_all(source.join("lib/a")).unwrap();
        std::fs::create_dir_all(&build).unwrap();
        std::fs::write(source.join("lib/a/A.java"), "class A {}").unwrap();
        std::fs::write(source.join("lib/a/nested.txt"), "x").unwrap();
        (temp, source, build)
    }

    #[test]
    fn test_resolve_variants() {
        let (_temp, source, build) = roots();
        let produced = HashSet::from(["$(BUILD_ROOT)/gen/B.java"]);
        let resolver = InputResolver::new(&source, &build, &produced, &ContentHash);

        assert!(matches!(
            resolver.resolve("lib/a", "$(SOURCE_ROOT)/lib/a/A.java"),
            Resolution::Found(_)
        ));
        assert_eq!(
            resolver.resolve("lib/a", "$(BUILD_ROOT)/gen/B.java"),
            Resolution::Produced
        );
        assert_eq!(
            resolver.resolve("lib/a", "$(SOURCE_ROOT)/lib/a/Gone.java"),
            Resolution::Missing(vec!["$(SOURCE_ROOT)/lib/a/Gone.java".into()])
        );
        assert!(matches!(resolver.resolve("lib/a", "nested.txt"), Resolution::Found(_)));
        assert_eq!(
            resolver.resolve("lib/a", "gone.txt"),
            Resolution::Missing(vec!["gone.txt".into(), "lib/a/gone.txt".into()])
        );
    }

    #[test]
    fn test_content_identity_follows_content() {
        let (_temp, source, _build) = roots();
        let file = source.join("lib/a/A.java");
        let before = ContentHash.identify(&file).unwrap();
        std::fs::write(&file, "class A { int x; }").unwrap();
        assert_ne!(before, ContentHash.identify(&file).unwrap());
        assert!(ContentHash.identify(&source.join("lib")).is_ok());
    }

    #[test]
    fn test_resolve_all_keeps_order() {
        let (_temp, source, build) = roots();
        let produced = HashSet::new();
        let resolver = InputResolver::new(&source, &build, &produced, &PathMtime);

        let results = resolver.resolve_all(&[
            ("lib/a", "$(SOURCE_ROOT)/nope"),
            ("lib/a", "$(SOURCE_ROOT)/lib/a/A.java"),
        ]);
        assert!(matches!(results[0], Resolution::Missing(_)));
        assert!(matches!(results[1], Resolution::Found(_)));
    }
}
