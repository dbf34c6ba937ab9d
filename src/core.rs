use std::fmt;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Placeholder for the root of the source tree in generator paths.
pub const SOURCE_ROOT: &str = "$(SOURCE_ROOT)";
/// Placeholder for the root of the build output tree in generator paths.
pub const BUILD_ROOT: &str = "$(BUILD_ROOT)";

/// A 32-byte BLAKE3 digest.
///
/// This is the node identity (UID) of the build graph: two nodes with the same
/// `Hash32` are interchangeable, so it doubles as the key into the artifact
/// cache. It is serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let text = text.as_bytes();
        if text.len() != 64 {
            return None;
        }

        let nibble = |c: u8| match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        };

        let mut acc = [0u8; 32];
        for (i, pair) in text.chunks_exact(2).enumerate() {
            acc[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        }

        Some(Hash32(acc))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash32 {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash32::from_hex(s).ok_or_else(|| InvalidHash(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid 32-byte hex digest: {0:?}")]
pub struct InvalidHash(pub String);

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming BLAKE3 hasher usable through [`std::hash::Hash`].
///
/// Integer writes are little-endian and `usize` is widened to 64 bits, so the
/// digest of a value does not depend on the host platform.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl Blake3Hasher {
    /// Feeds a length-prefixed byte field.
    pub fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub fn finish32(self) -> Hash32 {
        self.into()
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn write_u32(&mut self, i: u32) {
        self.0.update(&i.to_le_bytes());
    }

    fn write_u64(&mut self, i: u64) {
        self.0.update(&i.to_le_bytes());
    }

    fn write_usize(&mut self, i: usize) {
        self.0.update(&(i as u64).to_le_bytes());
    }
}

/// Which tree a generator path is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Source,
    Build,
}

/// Splits `$(SOURCE_ROOT)/a/b` into `(Some(Root::Source), "a/b")`.
pub fn split_root(path: &str) -> (Option<Root>, &str) {
    for (prefix, root) in [(SOURCE_ROOT, Root::Source), (BUILD_ROOT, Root::Build)] {
        if let Some(rest) = path.strip_prefix(prefix) {
            return (Some(root), rest.trim_start_matches('/'));
        }
    }

    (None, path)
}

pub fn in_source(path: &str) -> bool {
    matches!(split_root(path).0, Some(Root::Source))
}

pub fn in_build(path: &str) -> bool {
    matches!(split_root(path).0, Some(Root::Build))
}

/// Rewrites the long root placeholders into the `$S` / `$B` display form.
pub fn abbreviate_roots(path: &str) -> String {
    path.replace(SOURCE_ROOT, "$S").replace(BUILD_ROOT, "$B")
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Normalizes a target path into its index key: no `.`/`..`, no leading or
/// trailing slashes, forward slashes only.
pub fn normalize_target(path: &str) -> String {
    let path = path.replace('\\', "/");
    let normal = normalize_path(Utf8Path::new(path.trim_matches('/')));
    normal.as_str().trim_end_matches('/').to_string()
}

/// Directory part of a slash-separated path (`a/b/c` -> `a/b`).
pub fn dirname(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Walks up from `start` to the first directory that looks like a repository
/// root (`.arcadia.root` marker or `build/ya.conf.json`).
pub fn detect_root(start: &Utf8Path) -> Option<Utf8PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".arcadia.root").exists() || dir.join("build/ya.conf.json").exists())
        .map(Utf8Path::to_path_buf)
}
