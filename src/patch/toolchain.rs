//! Toolchain path resolution.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{CallbackResult, PatchError};
use crate::graph::Graph;
use crate::patch::PatchOutcome;
use crate::target::semantic::{
    Annotation, TOOLCHAIN_NOT_FOUND, TOOLCHAIN_PLACEHOLDER, Toolchain, toolchain_version,
};

/// Locates a provisioned toolchain by major version.
pub trait ToolchainProvider: Send + Sync {
    fn locate(&self, version: u32) -> CallbackResult<Utf8PathBuf>;
}

impl<F> ToolchainProvider for F
where
    F: Fn(u32) -> CallbackResult<Utf8PathBuf> + Send + Sync,
{
    fn locate(&self, version: u32) -> CallbackResult<Utf8PathBuf> {
        self(version)
    }
}

/// Finds toolchains as `<root>/<prefix><version>*` directories.
pub struct DirToolchains {
    root: Utf8PathBuf,
    prefix: String,
}

impl DirToolchains {
    pub fn new(root: impl Into<Utf8PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }
}

impl ToolchainProvider for DirToolchains {
    fn locate(&self, version: u32) -> CallbackResult<Utf8PathBuf> {
        let pattern = format!("{}/{}{version}*", self.root, self.prefix);

        let mut found: Vec<Utf8PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("bad toolchain pattern {pattern}"))?
            .filter_map(Result::ok)
            .filter(|path| path.is_dir())
            .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
            .filter(|path| {
                // jdk1 must not match jdk17
                let name = path.file_name().unwrap_or_default();
                let rest = &name[self.prefix.len().min(name.len())..];
                let digits = rest.trim_start_matches(|c: char| c.is_ascii_digit());
                rest[..rest.len() - digits.len()] == version.to_string()
            })
            .collect();

        found.sort();
        match found.into_iter().next() {
            Some(path) => Ok(path),
            None => bail!("no {}{version} toolchain under {}", self.prefix, self.root),
        }
    }
}

/// Resolved toolchain paths of one patch pass, by version.
///
/// Each version is located at most once; failures are remembered too.
pub struct ToolchainCache {
    dir: Utf8PathBuf,
    resolved: HashMap<u32, Result<Utf8PathBuf, String>>,
}

impl ToolchainCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            resolved: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, version: u32, provider: &dyn ToolchainProvider) -> Result<&Utf8Path, &str> {
        let dir = &self.dir;
        let entry = self.resolved.entry(version).or_insert_with(|| {
            provider
                .locate(version)
                .and_then(|real| {
                    if !real.is_dir() {
                        bail!("toolchain directory {real} does not exist");
                    }
                    link(dir, version, &real)
                })
                .map_err(|err| {
                    tracing::error!(version, %err, "couldn't find toolchain");
                    format!("{err:#}")
                })
        });

        match entry {
            Ok(path) => Ok(path.as_path()),
            Err(message) => Err(message.as_str()),
        }
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

/// Absolute against the working directory; `path` need not exist.
fn absolute(path: &Utf8Path) -> CallbackResult<Utf8PathBuf> {
    let path = std::path::absolute(path).with_context(|| format!("couldn't make {path} absolute"))?;
    Ok(Utf8PathBuf::try_from(path)?)
}

/// Points `<dir>/<version>` at `real`, replacing a stale link. The returned
/// path is always absolute.
#[cfg(unix)]
fn link(dir: &Utf8Path, version: u32, real: &Utf8Path) -> CallbackResult<Utf8PathBuf> {
    let dir = absolute(dir)?;
    let real = absolute(real)?;
    let link = dir.join(version.to_string());

    if link.symlink_metadata().is_ok() {
        let current = std::fs::canonicalize(&link).ok();
        let target = std::fs::canonicalize(&real).ok();
        if current.is_none() || current != target {
            std::fs::remove_file(&link).with_context(|| format!("couldn't remove stale link {link}"))?;
        }
    }

    if link.symlink_metadata().is_err() {
        std::fs::create_dir_all(&dir).with_context(|| format!("couldn't create {dir}"))?;
        std::os::unix::fs::symlink(&real, &link).with_context(|| format!("couldn't link {link}"))?;
    }

    Ok(link)
}

#[cfg(not(unix))]
fn link(_dir: &Utf8Path, _version: u32, real: &Utf8Path) -> CallbackResult<Utf8PathBuf> {
    absolute(real)
}

pub(crate) fn patch_toolchains(
    graph: &mut Graph,
    cache: &mut ToolchainCache,
    provider: &dyn ToolchainProvider,
    is_requested: impl Fn(&str) -> bool,
    outcome: &mut PatchOutcome,
) {
    let mut reported = BTreeSet::new();

    for node in &mut graph.graph {
        let requested = is_requested(&node.target);

        for annotation in &mut node.semantics {
            match annotation {
                Annotation::ToolchainVersion(raw) => {
                    let normal = toolchain_version(raw).to_string();
                    if *raw != normal {
                        *raw = normal;
                        outcome.patched = true;
                    }
                }
                Annotation::ToolchainPath(Toolchain::Symbolic(raw)) => {
                    let version = toolchain_version(raw);

                    let path = if !requested {
                        format!("{TOOLCHAIN_PLACEHOLDER}{version}")
                    } else {
                        match cache.resolve(version, provider) {
                            Ok(path) => path.to_string(),
                            Err(message) => {
                                if reported.insert((version, node.target.clone())) {
                                    outcome.errors.push(PatchError::Toolchain {
                                        version,
                                        target: node.target.clone(),
                                        message: message.to_string(),
                                    });
                                }
                                TOOLCHAIN_NOT_FOUND.to_string()
                            }
                        }
                    };

                    *annotation = Annotation::ToolchainPath(Toolchain::Resolved(path));
                    outcome.patched = true;
                }
                _ => {}
            }
        }
    }
}
