//! Fragment collection, structural merge and reachability.
//!
//! The assembler takes what the generator emitted for every target and turns
//! it into the final graph:
//!
//! 1. fragments sharing a key are coalesced into one node,
//! 2. the subgraph reachable from the requested results is selected,
//! 3. inputs of reachable nodes are resolved (in parallel),
//! 4. UIDs are computed bottom-up and nodes with equal UIDs collapse,
//! 5. configure errors are aggregated per target.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::config::MergeOptions;
use crate::core::{Hash32, normalize_target};
use crate::error::{ConfigureFailure, GraphError};
use crate::graph::report::{ConfigureError, ErrorMap};
use crate::graph::resolve::{InputResolver, Resolution};
use crate::graph::uid::{compute_uids, emission_order, node_uid};
use crate::graph::{Cmd, Fragment, Graph, GraphNode};
use crate::target::TargetIndex;
use crate::target::semantic::Annotation;
use crate::utils::as_overhead;

/// Result of a successful merge pass.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub graph: Graph,
    /// Problems tolerated because `continue_on_failure` was set.
    pub errors: BTreeMap<String, ConfigureError>,
}

/// Builder collecting the inputs of one merge pass.
pub struct Assembler<'a> {
    index: &'a TargetIndex,
    options: &'a MergeOptions,
    fragments: Vec<Fragment>,
    auxiliary: Vec<Fragment>,
    requested: BTreeSet<String>,
}

/// A node after coalescing, before identity.
#[derive(Debug)]
struct Merged {
    key: String,
    target: String,
    cmds: Vec<Cmd>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    deps: Vec<String>,
    kv: BTreeMap<String, String>,
    semantics: Vec<Annotation>,
    result: bool,
    auxiliary: bool,
}

/// A problem found before reachability is known.
struct Deferred {
    node: usize,
    target: String,
    message: String,
}

fn extend_unique<T: PartialEq + Clone>(into: &mut Vec<T>, from: &[T]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

impl<'a> Assembler<'a> {
    pub fn new(index: &'a TargetIndex, options: &'a MergeOptions) -> Self {
        Self {
            index,
            options,
            fragments: Vec::new(),
            auxiliary: Vec::new(),
            requested: BTreeSet::new(),
        }
    }

    pub fn with_fragments(mut self, fragments: impl IntoIterator<Item = Fragment>) -> Self {
        self.fragments.extend(fragments);
        self
    }

    /// Fragments contributed by side channels, such as test data fetches.
    /// Their results are always part of the result set.
    pub fn with_auxiliary(mut self, fragments: impl IntoIterator<Item = Fragment>) -> Self {
        self.auxiliary.extend(fragments);
        self
    }

    /// Requests a target. Without any request every target counts as requested.
    pub fn request(mut self, path: impl AsRef<str>) -> Self {
        self.requested.insert(normalize_target(path.as_ref()));
        self
    }

    pub fn assemble(self) -> Result<Assembly, GraphError> {
        let s = Instant::now();

        for path in &self.requested {
            self.index.resolve(path)?;
        }

        let mut conflicts = Vec::new();
        let merged = self.coalesce(&mut conflicts);

        let position: HashMap<&str, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, node)| (node.key.as_str(), i))
            .collect();

        let mut dangling = Vec::new();
        let deps: Vec<Vec<usize>> = merged
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let mut found = Vec::new();
                for dep in &node.deps {
                    match position.get(dep.as_str()) {
                        Some(&j) if !found.contains(&j) => found.push(j),
                        Some(_) => {}
                        None => dangling.push(Deferred {
                            node: i,
                            target: node.target.clone(),
                            message: format!("Node {} depends on unknown node {dep}", node.key),
                        }),
                    }
                }
                found
            })
            .collect();

        let roots: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, node)| node.result && self.is_root(node))
            .map(|(i, _)| i)
            .collect();

        let reachable = reachability(merged.len(), &deps, &roots);

        let errors = ErrorMap::default();
        for problem in conflicts.into_iter().chain(dangling) {
            if reachable[problem.node] {
                errors.add_message(&problem.target, problem.message);
            }
        }

        // Only reachable nodes are resolved, identified and emitted.
        let kept: Vec<usize> = (0..merged.len()).filter(|&i| reachable[i]).collect();
        let compact: HashMap<usize, usize> = kept.iter().enumerate().map(|(new, &old)| (old, new)).collect();

        let fingerprints = self.resolve_inputs(&merged, &kept, &errors);

        let keys: Vec<&str> = kept.iter().map(|&i| merged[i].key.as_str()).collect();
        let kept_deps: Vec<Vec<usize>> = kept
            .iter()
            .map(|&i| deps[i].iter().map(|dep| compact[dep]).collect())
            .collect();

        let uids = compute_uids(&keys, &kept_deps, |i, dep_uids| {
            node_uid(&merged[kept[i]].cmds, &fingerprints[i], dep_uids)
        })?;

        let root_set: HashSet<usize> = roots.iter().filter_map(|old| compact.get(old).copied()).collect();
        let graph = self.collapse(&merged, &kept, &kept_deps, &uids, &root_set);

        let errors = errors.into_inner();
        for (target, error) in &errors {
            for (message, sub) in error.colored_errors() {
                tracing::error!(path = %target, sub, "{message}");
            }
        }

        tracing::info!(
            nodes = graph.len(),
            results = graph.result.len(),
            failed_targets = errors.len(),
            "build graph assembled {}",
            as_overhead(s)
        );

        if !errors.is_empty() && !self.options.continue_on_failure {
            return Err(GraphError::Configure(ConfigureFailure(errors)));
        }

        Ok(Assembly { graph, errors })
    }

    fn is_root(&self, node: &Merged) -> bool {
        node.auxiliary || self.requested.is_empty() || self.requested.contains(&node.target)
    }

    /// Groups fragments by key. The first fragment seen for a key owns the
    /// node; later ones contribute their lists.
    fn coalesce(&self, conflicts: &mut Vec<Deferred>) -> Vec<Merged> {
        let mut by_key: BTreeMap<String, Merged> = BTreeMap::new();
        let mut raw_conflicts: Vec<(String, String, String)> = Vec::new();

        let tagged = self
            .fragments
            .iter()
            .map(|f| (f, false))
            .chain(self.auxiliary.iter().map(|f| (f, true)));

        for (fragment, auxiliary) in tagged {
            let target = normalize_target(&fragment.target);
            let cmds: Vec<Cmd> = fragment.cmds.iter().map(Cmd::normalized).collect();

            match by_key.get_mut(&fragment.key) {
                Some(node) => {
                    if node.cmds.is_empty() {
                        node.cmds = cmds;
                    } else if !cmds.is_empty() && node.cmds != cmds {
                        raw_conflicts.push((
                            fragment.key.clone(),
                            target.clone(),
                            format!(
                                "Node {} declared by {target} conflicts with the command declared by {}",
                                fragment.key, node.target
                            ),
                        ));
                    }
                    extend_unique(&mut node.inputs, &fragment.inputs);
                    extend_unique(&mut node.outputs, &fragment.outputs);
                    extend_unique(&mut node.deps, &fragment.deps);
                    extend_unique(&mut node.semantics, &fragment.semantics);
                    for (key, value) in &fragment.kv {
                        node.kv.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    node.result |= fragment.result;
                    node.auxiliary |= auxiliary;
                }
                None => {
                    let mut node = Merged {
                        key: fragment.key.clone(),
                        target,
                        cmds,
                        inputs: Vec::new(),
                        outputs: Vec::new(),
                        deps: Vec::new(),
                        kv: fragment.kv.clone(),
                        semantics: Vec::new(),
                        result: fragment.result,
                        auxiliary,
                    };
                    extend_unique(&mut node.inputs, &fragment.inputs);
                    extend_unique(&mut node.outputs, &fragment.outputs);
                    extend_unique(&mut node.deps, &fragment.deps);
                    extend_unique(&mut node.semantics, &fragment.semantics);
                    by_key.insert(fragment.key.clone(), node);
                }
            }
        }

        let merged: Vec<Merged> = by_key.into_values().collect();

        for (key, target, message) in raw_conflicts {
            if let Some(node) = merged.iter().position(|node| node.key == key) {
                conflicts.push(Deferred { node, target, message });
            }
        }

        merged
    }

    /// Resolves the inputs of the kept nodes and returns their fingerprints,
    /// recording missing inputs against the owning target.
    fn resolve_inputs(&self, merged: &[Merged], kept: &[usize], errors: &ErrorMap) -> Vec<Vec<String>> {
        let produced: HashSet<&str> = kept
            .iter()
            .flat_map(|&i| merged[i].outputs.iter().map(String::as_str))
            .collect();

        let requests: Vec<(&str, &str)> = kept
            .iter()
            .flat_map(|&i| {
                let node = &merged[i];
                node.inputs
                    .iter()
                    .map(move |input| (node.target.as_str(), input.as_str()))
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let policy = self.options.identity.policy();
        let resolver = InputResolver::new(
            &self.options.source_root,
            &self.options.build_root,
            &produced,
            policy.as_ref(),
        );

        let resolved: HashMap<(&str, &str), Resolution> = requests
            .iter()
            .copied()
            .zip(resolver.resolve_all(&requests))
            .collect();

        kept.iter()
            .map(|&i| {
                let node = &merged[i];
                node.inputs
                    .iter()
                    .map(|input| {
                        let resolution = &resolved[&(node.target.as_str(), input.as_str())];
                        if let Resolution::Missing(names) = resolution {
                            for name in names {
                                errors.add_missing(&node.target, name.clone());
                            }
                        }
                        resolution.fingerprint(input)
                    })
                    .collect()
            })
            .collect()
    }

    /// Builds the output graph, folding nodes with equal UIDs into one.
    fn collapse(
        &self,
        merged: &[Merged],
        kept: &[usize],
        kept_deps: &[Vec<usize>],
        uids: &[Hash32],
        roots: &HashSet<usize>,
    ) -> Graph {
        let mut by_uid: BTreeMap<Hash32, GraphNode> = BTreeMap::new();

        for (i, &old) in kept.iter().enumerate() {
            let source = &merged[old];
            let uid = uids[i];
            let is_root = roots.contains(&i);

            if let Some(node) = by_uid.get_mut(&uid) {
                tracing::debug!(key = %source.key, %uid, "collapsing identical node");
                extend_unique(&mut node.inputs, &source.inputs);
                extend_unique(&mut node.outputs, &source.outputs);
                extend_unique(&mut node.semantics, &source.semantics);
                for (key, value) in &source.kv {
                    node.kv.entry(key.clone()).or_insert_with(|| value.clone());
                }
                node.result |= is_root;
                continue;
            }

            let mut deps = Vec::new();
            extend_unique(
                &mut deps,
                &kept_deps[i].iter().map(|&dep| uids[dep]).collect::<Vec<_>>(),
            );

            let mut kv = source.kv.clone();
            if let Some(target) = self.index.get(&source.target) {
                if let Some(bundle) = target.bundle_name() {
                    kv.insert("bundle_name".into(), bundle.into());
                }
                if target.disables_cache() {
                    kv.insert("disable_cache".into(), "yes".into());
                }
            }

            by_uid.insert(
                uid,
                GraphNode {
                    uid,
                    target: source.target.clone(),
                    inputs: source.inputs.clone(),
                    outputs: source.outputs.clone(),
                    deps,
                    cmds: source.cmds.clone(),
                    kv,
                    semantics: source.semantics.clone(),
                    result: is_root,
                },
            );
        }

        let nodes: Vec<GraphNode> = by_uid.into_values().collect();
        let order = emission_order(&nodes);

        let mut slots: Vec<Option<GraphNode>> = nodes.into_iter().map(Some).collect();
        let graph: Vec<GraphNode> = order.into_iter().filter_map(|i| slots[i].take()).collect();
        let result = graph.iter().filter(|node| node.result).map(|node| node.uid).collect();

        Graph { graph, result }
    }
}

/// Marks every node reachable from `roots` along dependency edges.
fn reachability(len: usize, deps: &[Vec<usize>], roots: &[usize]) -> Vec<bool> {
    let mut graph = DiGraph::<(), ()>::with_capacity(len, 0);
    let indices: Vec<NodeIndex> = (0..len).map(|_| graph.add_node(())).collect();

    for (i, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            graph.add_edge(indices[i], indices[dep], ());
        }
    }

    let mut reachable = vec![false; len];
    for &root in roots {
        if reachable[root] {
            continue;
        }
        let mut dfs = Dfs::new(&graph, indices[root]);
        while let Some(index) = dfs.next(&graph) {
            reachable[index.index()] = true;
        }
    }

    reachable
}
