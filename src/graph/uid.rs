//! Content-derived node identity.
//!
//! A UID is BLAKE3 over the normalized commands, the sorted input
//! fingerprints and the sorted dependency UIDs. It is computed bottom-up so a
//! change anywhere below a node changes the node too.

use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Blake3Hasher, Hash32};
use crate::error::GraphError;
use crate::graph::{Cmd, GraphNode};

pub fn node_uid(cmds: &[Cmd], fingerprints: &[String], dep_uids: &[Hash32]) -> Hash32 {
    let mut hasher = Blake3Hasher::default();

    hasher.field((cmds.len() as u64).to_le_bytes());
    for cmd in cmds.iter().map(Cmd::normalized) {
        hasher.field(cmd.cwd.as_deref().unwrap_or_default());
        hasher.field((cmd.cmd_args.len() as u64).to_le_bytes());
        for arg in &cmd.cmd_args {
            hasher.field(arg);
        }
        hasher.field((cmd.env.len() as u64).to_le_bytes());
        for (key, value) in &cmd.env {
            hasher.field(key).field(value);
        }
    }

    let inputs: BTreeSet<&str> = fingerprints.iter().map(String::as_str).collect();
    hasher.field((inputs.len() as u64).to_le_bytes());
    for input in inputs {
        hasher.field(input);
    }

    let deps: BTreeSet<&Hash32> = dep_uids.iter().collect();
    hasher.field((deps.len() as u64).to_le_bytes());
    for dep in deps {
        hasher.field(dep.as_bytes());
    }

    hasher.finish32()
}

/// Assigns a UID to every node, dependencies first.
///
/// `deps[i]` lists the positions node `i` depends on and `uid_of(i, deps)`
/// receives the already computed UIDs of those dependencies.
pub fn compute_uids<F>(keys: &[&str], deps: &[Vec<usize>], uid_of: F) -> Result<Vec<Hash32>, GraphError>
where
    F: Fn(usize, &[Hash32]) -> Hash32,
{
    let mut graph = DiGraph::<usize, ()>::with_capacity(keys.len(), 0);
    let indices: Vec<NodeIndex> = (0..keys.len()).map(|i| graph.add_node(i)).collect();

    for (i, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            graph.add_edge(indices[dep], indices[i], ());
        }
    }

    let order = petgraph::algo::toposort(&graph, None)
        .map_err(|cycle| GraphError::Cycle(keys[graph[cycle.node_id()]].to_string()))?;

    let span = tracing::span!(Level::INFO, "computing_uids");
    span.pb_set_length(order.len() as u64);
    span.pb_set_style(&crate::utils::style_bar());
    span.pb_set_message("Computing node identities...");
    let _enter = span.enter();

    let mut uids = vec![Hash32::default(); keys.len()];
    for index in order {
        let i = graph[index];
        let dep_uids: Vec<Hash32> = deps[i].iter().map(|&dep| uids[dep]).collect();
        uids[i] = uid_of(i, &dep_uids);
        span.pb_inc(1);
    }

    Ok(uids)
}

/// Emission order of the final graph: dependencies before dependents, ties
/// broken by the smallest UID.
pub fn emission_order(nodes: &[GraphNode]) -> Vec<usize> {
    let position: HashMap<Hash32, usize> = nodes.iter().enumerate().map(|(i, n)| (n.uid, i)).collect();

    let mut pending = vec![0usize; nodes.len()];
    let mut dependents = vec![Vec::new(); nodes.len()];

    for (i, node) in nodes.iter().enumerate() {
        let deps: BTreeSet<usize> = node.deps.iter().filter_map(|uid| position.get(uid).copied()).collect();
        pending[i] = deps.len();
        for dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<Hash32> = nodes
        .iter()
        .zip(&pending)
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| node.uid)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(uid) = ready.pop_first() {
        let i = position[&uid];
        order.push(i);

        for &next in &dependents[i] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.insert(nodes[next].uid);
            }
        }
    }

    order
}
