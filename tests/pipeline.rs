use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use forgegraph::{
    Annotation, Assembler, CacheClient, CallbackResult, ChunkedQueue, Cmd, Fragment, Graph,
    GraphError, Hash32, MergeOptions, PatchOptions, Patcher, ProcessorRegistry, RemoteStore,
    RetryPolicy, Sweep, TargetDescriptor, TargetIndex, Toolchain, TransportError,
    TransportErrorKind,
};

struct Workspace {
    _temp: tempfile::TempDir,
    base: Utf8PathBuf,
    options: MergeOptions,
    index: TargetIndex,
}

fn workspace() -> Workspace {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    std::fs::create_dir_all(base.join("src/lib/a")).unwrap();
    std::fs::create_dir_all(base.join("src/app")).unwrap();
    std::fs::create_dir_all(base.join("build")).unwrap();
    std::fs::write(base.join("src/lib/a/A.java"), "class A {}").unwrap();
    std::fs::write(base.join("src/app/Main.java"), "class Main {}").unwrap();

    let options = MergeOptions::default()
        .with_source_root(base.join("src"))
        .with_build_root(base.join("build"));

    let index = TargetIndex::new([
        TargetDescriptor::new("lib/a"),
        TargetDescriptor::new("app").with_dep("lib/a"),
    ]);

    Workspace {
        _temp: temp,
        base,
        options,
        index,
    }
}

fn compile_a(args: &[&str]) -> Fragment {
    Fragment::new("a", "lib/a")
        .with_cmd(Cmd::new(args.iter().copied()))
        .with_input("$(SOURCE_ROOT)/lib/a/A.java")
        .with_output("$(BUILD_ROOT)/lib/a/a.jar")
        .as_result()
}

fn link_app() -> Fragment {
    Fragment::new("app", "app")
        .with_cmd(Cmd::new(["javac", "-cp", "a.jar", "Main.java"]))
        .with_input("$(SOURCE_ROOT)/app/Main.java")
        .with_input("$(BUILD_ROOT)/lib/a/a.jar")
        .with_output("$(BUILD_ROOT)/app/app.jar")
        .with_dep("a")
        .as_result()
}

fn assemble(ws: &Workspace, fragments: Vec<Fragment>) -> Graph {
    Assembler::new(&ws.index, &ws.options)
        .with_fragments(fragments)
        .request("app")
        .assemble()
        .unwrap()
        .graph
}

fn uid_of(graph: &Graph, target: &str) -> Hash32 {
    graph.graph.iter().find(|node| node.target == target).unwrap().uid
}

#[test]
fn assembly_is_deterministic() {
    let ws = workspace();
    let fragments = vec![link_app(), compile_a(&["javac", "A.java"])];

    let first = assemble(&ws, fragments.clone()).to_json().unwrap();
    let second = assemble(&ws, fragments).to_json().unwrap();
    assert_eq!(first, second);
}

#[test]
fn uid_follows_command_and_dependencies() {
    let ws = workspace();

    let base = assemble(&ws, vec![compile_a(&["javac", "A.java"]), link_app()]);
    let changed = assemble(&ws, vec![compile_a(&["javac", "-g", "A.java"]), link_app()]);
    let spaced = assemble(&ws, vec![compile_a(&[" javac", "", "A.java "]), link_app()]);

    assert_ne!(uid_of(&base, "lib/a"), uid_of(&changed, "lib/a"));
    assert_ne!(uid_of(&base, "app"), uid_of(&changed, "app"));

    assert_eq!(uid_of(&base, "lib/a"), uid_of(&spaced, "lib/a"));
    assert_eq!(uid_of(&base, "app"), uid_of(&spaced, "app"));
}

#[test]
fn identical_nodes_collapse() {
    let ws = workspace();
    let twin = |key: &str| {
        Fragment::new(key, "lib/a")
            .with_cmd(Cmd::new(["javac", "A.java"]))
            .with_input("$(SOURCE_ROOT)/lib/a/A.java")
            .as_result()
    };

    let assembly = Assembler::new(&ws.index, &ws.options)
        .with_fragments([twin("first"), twin("second")])
        .request("lib/a")
        .assemble()
        .unwrap();

    assert_eq!(assembly.graph.len(), 1);
    assert_eq!(assembly.graph.result.len(), 1);
}

#[test]
fn missing_input_is_aggregated_once() {
    let ws = workspace();
    let missing = "$(SOURCE_ROOT)/lib/a/Gone.java";
    let fragments = [
        compile_a(&["javac", "A.java"]).with_input(missing),
        Fragment::new("a-doc", "lib/a")
            .with_cmd(Cmd::new(["javadoc", "Gone.java"]))
            .with_input(missing)
            .as_result(),
    ];

    let err = Assembler::new(&ws.index, &ws.options)
        .with_fragments(fragments.clone())
        .assemble()
        .unwrap_err();
    assert!(matches!(err, GraphError::Configure(_)));

    let options = ws.options.clone().with_continue_on_failure(true);
    let assembly = Assembler::new(&ws.index, &options)
        .with_fragments(fragments)
        .assemble()
        .unwrap();

    let error = &assembly.errors["lib/a"];
    assert_eq!(error.missing_inputs.len(), 1);
    assert!(error.missing_inputs.contains(missing));
    assert_eq!(assembly.graph.len(), 2);
}

fn patcher(base: &Utf8Path) -> Patcher {
    let jdk = base.join("jdk17");
    std::fs::create_dir_all(&jdk).unwrap();

    Patcher::new(&PatchOptions::default().with_toolchain_cache_dir(base.join("links")))
        .unwrap()
        .with_registry(ProcessorRegistry::from_iter([("lombok.Processor", "contrib/lombok")]))
        .with_provider(move |version: u32| -> CallbackResult<Utf8PathBuf> {
            if version == 17 { Ok(jdk.clone()) } else { bail!("no jdk {version}") }
        })
}

#[test]
fn patching_twice_equals_patching_once() {
    let ws = workspace();
    std::fs::create_dir_all(ws.base.join("src/contrib/lombok")).unwrap();
    std::fs::write(ws.base.join("src/contrib/lombok/Lombok.java"), "").unwrap();

    let index = TargetIndex::new([
        TargetDescriptor::new("contrib/lombok"),
        TargetDescriptor::new("lib/a").with_dep("contrib/lombok"),
    ]);
    let lombok = Fragment::new("lombok", "contrib/lombok")
        .with_cmd(Cmd::new(["javac", "Lombok.java"]))
        .with_input("$(SOURCE_ROOT)/contrib/lombok/Lombok.java")
        .with_output("$(BUILD_ROOT)/contrib/lombok/1.18.30/lombok.jar");
    let a = compile_a(&["javac", "A.java"])
        .with_dep("lombok")
        .with_semantic(Annotation::ProcessorClasses(vec!["lombok.Processor".into()]))
        .with_semantic(Annotation::ToolchainVersion("JDK17_RESOURCE".into()))
        .with_semantic(Annotation::ToolchainPath(Toolchain::Symbolic("$(JDK17_RESOURCE_GLOBAL)".into())));

    let mut graph = Assembler::new(&index, &ws.options)
        .with_fragments([lombok, a])
        .request("lib/a")
        .assemble()
        .unwrap()
        .graph;

    let mut patcher = patcher(&ws.base);
    let first = patcher.apply(&mut graph).check().unwrap();
    assert!(first.patched);
    let once = graph.to_json().unwrap();

    let second = patcher.apply(&mut graph).check().unwrap();
    assert!(!second.patched);
    assert_eq!(graph.to_json().unwrap(), once);

    let node = graph.graph.iter().find(|node| node.target == "lib/a").unwrap();
    assert!(node.semantics.contains(&Annotation::Processors(vec![
        "contrib/lombok/1.18.30/lombok.jar".into()
    ])));
}

fn queue_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("events")).unwrap();
    (temp, root)
}

fn entries(dir: &Utf8Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn queue_survives_restart() {
    let (_temp, root) = queue_root();

    let writer: ChunkedQueue<Value> = ChunkedQueue::open(&root).unwrap();
    for n in 0..3 {
        writer.append(json!({ "n": n }), false).unwrap();
    }
    drop(writer);

    let reader: ChunkedQueue<Value> = ChunkedQueue::open(&root).unwrap();
    let mut seen = Vec::new();
    let stats = reader.consume(|events| {
        seen.extend(events);
        Ok(Sweep::Continue)
    });

    assert_eq!(seen, vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
    assert_eq!(stats.events, 3);
    assert_eq!(entries(&root.join("data")), 0);
    assert_eq!(entries(&root.join("locks")), 0);

    let again = reader.consume(|_| Ok(Sweep::Continue));
    assert_eq!(again.events, 0);
}

#[test]
fn urgent_events_come_first() {
    let (_temp, root) = queue_root();
    let mut order = Vec::new();

    let queue: ChunkedQueue<Value> = ChunkedQueue::open(&root).unwrap();
    queue.append(json!("normal"), false).unwrap();
    queue.append(json!("urgent"), true).unwrap();

    queue.drain_urgent(|events| {
        order.extend_from_slice(events);
        Ok(())
    });
    assert_eq!(queue.consume(|_| Ok(Sweep::Continue)).events, 0);
    drop(queue);

    let reader: ChunkedQueue<Value> = ChunkedQueue::open(&root).unwrap();
    reader.consume(|events| {
        order.extend(events);
        Ok(Sweep::Continue)
    });

    assert_eq!(order, vec![json!("urgent"), json!("normal")]);
}

#[test]
fn cleanup_removes_only_orphan_locks() {
    let (_temp, root) = queue_root();
    let queue: ChunkedQueue<Value> = ChunkedQueue::open(&root).unwrap();

    std::fs::write(root.join("locks/2024_01_01_00_00_00_orphaned"), "").unwrap();
    std::fs::write(root.join("locks/2024_01_01_00_00_00_occupied"), "").unwrap();
    std::fs::write(root.join("data/2024_01_01_00_00_00_occupied"), "{}\n").unwrap();

    let stats = queue.cleanup(1000).unwrap();

    assert_eq!(stats.orphan_locks, 1);
    assert!(!root.join("locks/2024_01_01_00_00_00_orphaned").exists());
    assert!(root.join("locks/2024_01_01_00_00_00_occupied").exists());
    assert!(root.join("data/2024_01_01_00_00_00_occupied").exists());
}

struct Unreachable {
    calls: AtomicUsize,
}

impl RemoteStore for Unreachable {
    fn has(&self, _: &Hash32) -> Result<bool, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::new(TransportErrorKind::Unavailable, "connection refused"))
    }

    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError> {
        self.has(uid).map(|_| None)
    }

    fn put(&self, uid: &Hash32, _: &[u8]) -> Result<(), TransportError> {
        self.has(uid).map(|_| ())
    }
}

#[test]
fn cache_disables_after_retries() {
    let store = Arc::new(Unreachable {
        calls: AtomicUsize::new(0),
    });
    let client = CacheClient::new(Arc::clone(&store), RetryPolicy::new(3, Duration::from_millis(1)));

    let err = client.get(&Hash32::hash(b"node")).unwrap_err();
    assert_eq!(err.kind, TransportErrorKind::Unavailable);
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert!(client.is_disabled());

    let err = client.put(&Hash32::hash(b"node"), b"artifact").unwrap_err();
    assert_eq!(err.kind, TransportErrorKind::Disabled);
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
}
