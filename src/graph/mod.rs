//! The build graph: generator fragments in, identified nodes out.

pub mod merge;
pub mod report;
pub mod resolve;
pub mod uid;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::GraphError;
use crate::target::semantic::Annotation;

pub use merge::{Assembler, Assembly};
pub use report::{BuildEvent, ConfigureError, report_events};
pub use resolve::Identity;

/// One command of a node, forwarded to the executor as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cmd {
    pub cmd_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Cmd {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd_args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Surrounding whitespace and empty arguments carry no meaning.
    pub fn normalized(&self) -> Self {
        Self {
            cmd_args: self
                .cmd_args
                .iter()
                .map(|arg| arg.trim())
                .filter(|arg| !arg.is_empty())
                .map(str::to_string)
                .collect(),
            cwd: self
                .cwd
                .as_deref()
                .map(str::trim)
                .filter(|cwd| !cwd.is_empty())
                .map(str::to_string),
            env: self.env.clone(),
        }
    }
}

/// A raw node description emitted by the external generator for one target.
///
/// `key` identifies the node inside one generator run and `deps` refer to
/// other fragments by key. Fragments sharing a key are the same node seen from
/// several targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub key: String,
    pub target: String,
    #[serde(default)]
    pub cmds: Vec<Cmd>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub kv: BTreeMap<String, String>,
    #[serde(default)]
    pub semantics: Vec<Annotation>,
    /// Marks an output the target was requested for.
    #[serde(default)]
    pub result: bool,
}

impl Fragment {
    pub fn new(key: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_cmd(mut self, cmd: Cmd) -> Self {
        self.cmds.push(cmd);
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    pub fn with_dep(mut self, key: impl Into<String>) -> Self {
        self.deps.push(key.into());
        self
    }

    pub fn with_semantic(mut self, annotation: Annotation) -> Self {
        self.semantics.push(annotation);
        self
    }

    pub fn as_result(mut self) -> Self {
        self.result = true;
        self
    }
}

/// One executable step of the final graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub uid: Hash32,
    pub target: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub deps: Vec<Hash32>,
    pub cmds: Vec<Cmd>,
    #[serde(default)]
    pub kv: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantics: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub result: bool,
}

/// The serialized graph handed to the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub graph: Vec<GraphNode>,
    pub result: BTreeSet<Hash32>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn node(&self, uid: &Hash32) -> Option<&GraphNode> {
        self.graph.iter().find(|node| &node.uid == uid)
    }

    /// Position of each node in `graph`, by UID.
    pub fn positions(&self) -> HashMap<Hash32, usize> {
        self.graph
            .iter()
            .enumerate()
            .map(|(i, node)| (node.uid, i))
            .collect()
    }

    /// Distinct target paths owning at least one node.
    pub fn targets(&self) -> BTreeSet<&str> {
        self.graph.iter().map(|node| node.target.as_str()).collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, GraphError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, GraphError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn read(path: &Utf8Path) -> Result<Self, GraphError> {
        Self::from_json(&std::fs::read(path)?)
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), GraphError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
