//! Semantic annotations attached by the graph generator.
//!
//! The generator emits annotations as loose string tuples where the first
//! element is a tag. They are parsed once into [`Annotation`] so the patcher
//! can match on variants; tuples we do not recognize are carried verbatim in
//! [`Annotation::Opaque`] and serialized back unchanged.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const TAG_PROCESSOR_CLASSES: &str = "annotation_processors";
pub const TAG_PROCESSORS: &str = "use_annotation_processor";
pub const TAG_TOOLCHAIN_VERSION: &str = "jdk_version";
pub const TAG_TOOLCHAIN_PATH: &str = "jdk_path";
pub const TAG_CONSUMER_TYPE: &str = "consumer-type";
pub const TAG_BUNDLE_NAME: &str = "bundle-name";
pub const TAG_DISABLE_CACHE: &str = "vcs-info-disable-cache";

/// Sentinel written in place of a toolchain path that could not be provisioned.
pub const TOOLCHAIN_NOT_FOUND: &str = "NOT_FOUND";
/// Prefix of the placeholder written for nodes outside the requested targets.
pub const TOOLCHAIN_PLACEHOLDER: &str = "JDK_PATH_";
/// Opening of a `$(NAME)` resource variable.
const RESOURCE_VARIABLE: &str = "$(";

static TOOLCHAIN_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:JDK|jdk)(\d+)").expect("valid toolchain version pattern"));

/// Reference to a toolchain location, before or after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Toolchain {
    /// Resource variable naming a toolchain, e.g. `$(JDK17_RESOURCE_GLOBAL)`.
    Symbolic(String),
    /// Anything without a resource variable: a local path, the not-found
    /// sentinel or a placeholder.
    Resolved(String),
}

impl Toolchain {
    fn parse(raw: String) -> Self {
        if raw.contains(RESOURCE_VARIABLE) {
            Toolchain::Symbolic(raw)
        } else {
            Toolchain::Resolved(raw)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Toolchain::Symbolic(s) | Toolchain::Resolved(s) => s,
        }
    }
}

/// A parsed generator annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum Annotation {
    /// Symbolic processor classes that still need to be mapped onto dependencies.
    ProcessorClasses(Vec<String>),
    /// Concrete processor artifact paths.
    Processors(Vec<String>),
    /// Toolchain version, either raw (`JDK17_RESOURCE`) or normalized (`17`).
    ToolchainVersion(String),
    ToolchainPath(Toolchain),
    ConsumerType(String),
    BundleName(String),
    DisableCache(String),
    /// Anything unrecognized, kept as the raw tuple.
    Opaque(Vec<String>),
}

impl Annotation {
    pub fn tag(&self) -> &str {
        match self {
            Annotation::ProcessorClasses(_) => TAG_PROCESSOR_CLASSES,
            Annotation::Processors(_) => TAG_PROCESSORS,
            Annotation::ToolchainVersion(_) => TAG_TOOLCHAIN_VERSION,
            Annotation::ToolchainPath(_) => TAG_TOOLCHAIN_PATH,
            Annotation::ConsumerType(_) => TAG_CONSUMER_TYPE,
            Annotation::BundleName(_) => TAG_BUNDLE_NAME,
            Annotation::DisableCache(_) => TAG_DISABLE_CACHE,
            Annotation::Opaque(raw) => raw.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn is_truthy(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "y" | "yes" | "t" | "true" | "on" | "1"
        )
    }
}

impl From<Vec<String>> for Annotation {
    fn from(mut raw: Vec<String>) -> Self {
        let Some(tag) = raw.first().cloned() else {
            return Annotation::Opaque(raw);
        };

        match (tag.as_str(), raw.len()) {
            (TAG_PROCESSOR_CLASSES, _) => Annotation::ProcessorClasses(raw.split_off(1)),
            (TAG_PROCESSORS, _) => Annotation::Processors(raw.split_off(1)),
            (TAG_TOOLCHAIN_VERSION, 2) => Annotation::ToolchainVersion(raw.swap_remove(1)),
            (TAG_TOOLCHAIN_PATH, 2) => Annotation::ToolchainPath(Toolchain::parse(raw.swap_remove(1))),
            (TAG_CONSUMER_TYPE, 2) => Annotation::ConsumerType(raw.swap_remove(1)),
            (TAG_BUNDLE_NAME, 2) => Annotation::BundleName(raw.swap_remove(1)),
            (TAG_DISABLE_CACHE, 2) => Annotation::DisableCache(raw.swap_remove(1)),
            _ => Annotation::Opaque(raw),
        }
    }
}

impl From<Annotation> for Vec<String> {
    fn from(annotation: Annotation) -> Self {
        let tag = annotation.tag().to_string();

        let rest = match annotation {
            Annotation::Opaque(raw) => return raw,
            Annotation::ProcessorClasses(args) | Annotation::Processors(args) => args,
            Annotation::ToolchainPath(toolchain) => vec![toolchain.as_str().to_string()],
            Annotation::ToolchainVersion(arg)
            | Annotation::ConsumerType(arg)
            | Annotation::BundleName(arg)
            | Annotation::DisableCache(arg) => vec![arg],
        };

        let mut raw = Vec::with_capacity(rest.len() + 1);
        raw.push(tag);
        raw.extend(rest);
        raw
    }
}

/// Extracts the toolchain version from a resource variable name.
///
/// `JDK17_RESOURCE_GLOBAL` gives 17; a bare number is returned as is; anything
/// else gives 0.
pub fn toolchain_version(text: &str) -> u32 {
    if let Ok(version) = text.trim().parse() {
        return version;
    }

    TOOLCHAIN_VERSION
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}
