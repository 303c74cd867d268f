//! End-to-end tests: workspace on disk, tree-sitter front end, coordinator
//! thread and composite queries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use cxx_indexer::index::NameRole;
use cxx_indexer::indexer::{FullStrategy, TreeSitterFrontend};
use cxx_indexer::{
    BindingResolver, Direction, Filter, IndexManager, LocationKey, ProjectConfig, ResourceEvent,
    WorkspaceConfig,
};

const TIMEOUT: Duration = Duration::from_secs(60);

fn workspace(dir: &Path, projects: Vec<ProjectConfig>) -> WorkspaceConfig {
    let mut config = WorkspaceConfig::default();
    config.workspace.root = dir.to_path_buf();
    config.projects = projects;
    config
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

/// Rewrites a file and moves its mtime forward so the change is visible
/// even within the same millisecond.
fn rewrite(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

fn indexed(config: WorkspaceConfig) -> IndexManager {
    let manager = IndexManager::new(config).unwrap();
    manager.reindex_all().unwrap();
    assert!(manager.join(Some(TIMEOUT)));
    manager
}

/// a depends on b, b depends on c; b includes c's header.
fn chain(dir: &Path) -> IndexManager {
    write(dir, "c/c.h", "int shared_c();\n");
    write(dir, "c/c.cpp", "#include \"c.h\"\nint shared_c() { return 1; }\n");
    write(
        dir,
        "b/b.cpp",
        "#include \"c.h\"\nint b_func() { return shared_c(); }\n",
    );
    write(dir, "a/a.cpp", "int a_func() { return 0; }\n");
    indexed(workspace(
        dir,
        vec![
            ProjectConfig::new("c", "c"),
            ProjectConfig::new("b", "b")
                .depends_on("c")
                .include_path("../c"),
            ProjectConfig::new("a", "a").depends_on("b"),
        ],
    ))
}

fn has_binding(manager: &IndexManager, project: &str, direction: Direction, name: &str) -> bool {
    let handle = manager.index(project, direction).unwrap();
    let view = handle.lock().unwrap();
    !view
        .find_bindings_by_exact_name(&[name], &Filter::all())
        .is_empty()
}

#[test]
fn test_composite_follows_dependency_direction() {
    let dir = TempDir::new().unwrap();
    let manager = chain(dir.path());

    assert_eq!(
        manager.index("b", Direction::None).unwrap().projects(),
        ["b".to_string()]
    );
    assert_eq!(
        manager.index("b", Direction::DependsOn).unwrap().projects(),
        ["b".to_string(), "c".to_string()]
    );
    assert_eq!(
        manager
            .index("c", Direction::DependedOnBy)
            .unwrap()
            .projects()
            .len(),
        3
    );
    assert_eq!(manager.index("b", Direction::Both).unwrap().projects().len(), 3);

    assert!(has_binding(&manager, "b", Direction::None, "b_func"));
    assert!(!has_binding(&manager, "b", Direction::None, "a_func"));
    assert!(!has_binding(&manager, "c", Direction::DependsOn, "b_func"));
    assert!(has_binding(&manager, "c", Direction::DependedOnBy, "a_func"));
}

#[test]
fn test_shared_header_binding_is_merged_across_fragments() {
    let dir = TempDir::new().unwrap();
    let manager = chain(dir.path());

    let handle = manager.index("c", Direction::DependedOnBy).unwrap();
    let view = handle.lock().unwrap();
    let resolver = BindingResolver::new(&view);
    let shared = resolver.find_exact("shared_c", Some("function")).unwrap();
    // Declared in the header both c and b indexed.
    assert_eq!(shared.parts.len(), 2);
    assert_eq!(resolver.find_declarations(&shared).len(), 1);
    assert_eq!(resolver.find_definitions(&shared).len(), 1);

    let references = resolver.find_references(&shared);
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].location, &LocationKey::workspace("b", "b.cpp"));
    let enclosing = resolver.enclosing_definition(&references[0]).unwrap();
    assert_eq!(resolver.binding_of(&enclosing).unwrap().qualified(), "b_func");
}

#[test]
fn test_body_references_resolve_to_enclosing_function() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "core/main.c",
        "int var;\nvoid func(void);\nint main() {\n  func();\n  var = 1;\n  return 0;\n}\n",
    );
    let manager = indexed(workspace(dir.path(), vec![ProjectConfig::new("core", "core")]));

    let handle = manager.index("core", Direction::None).unwrap();
    let view = handle.lock().unwrap();
    let resolver = BindingResolver::new(&view);

    let var = resolver.find_exact("var", None).unwrap();
    let writes = resolver.find_writes(&var);
    assert_eq!(writes.len(), 1);
    let enclosing = resolver.enclosing_definition(&writes[0]).unwrap();
    assert_eq!(enclosing.role(), NameRole::Definition);
    assert_eq!(resolver.binding_of(&enclosing).unwrap().qualified(), "main");
    assert!(resolver.enclosing_definition(&enclosing).is_none());

    let func = resolver.find_exact("func", None).unwrap();
    assert_eq!(resolver.find_declarations(&func).len(), 1);
    assert!(resolver.find_definitions(&func).is_empty());
    let call = resolver.find_references(&func);
    assert_eq!(call.len(), 1);
    assert_eq!(
        resolver
            .resolve_at(call[0].location, call[0].record.offset)
            .unwrap()
            .qualified(),
        "func"
    );
}

#[test]
fn test_header_indexed_once_per_macro_context() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "core/h.h",
        "#ifdef X\nvoid foo();\n#else\nvoid bar();\n#endif\n",
    );
    write(
        dir.path(),
        "core/main.cpp",
        "#define X\n#include \"h.h\"\n#undef X\n#include \"h.h\"\n#define X\n#include \"h.h\"\n",
    );
    let manager = indexed(workspace(dir.path(), vec![ProjectConfig::new("core", "core")]));

    let handle = manager.index("core", Direction::None).unwrap();
    let view = handle.lock().unwrap();
    assert_eq!(view.get_files(&LocationKey::workspace("core", "h.h")).len(), 2);

    let resolver = BindingResolver::new(&view);
    for name in ["foo", "bar"] {
        let binding = resolver.find_exact(name, None).unwrap();
        assert_eq!(resolver.find_declarations(&binding).len(), 1, "{}", name);
    }
}

#[test]
fn test_changed_header_reindexes_its_includers() {
    let dir = TempDir::new().unwrap();
    let header = write(dir.path(), "core/c.h", "int one();\n");
    write(
        dir.path(),
        "core/a.cpp",
        "#include \"c.h\"\nint use() { return one(); }\n",
    );
    let manager = indexed(workspace(dir.path(), vec![ProjectConfig::new("core", "core")]));
    assert!(!has_binding(&manager, "core", Direction::None, "two"));

    rewrite(&header, "int one();\nint two();\n");
    manager
        .handle_event(ResourceEvent::FileModified(header))
        .unwrap();
    assert!(manager.join(Some(TIMEOUT)));

    assert!(has_binding(&manager, "core", Direction::None, "two"));
    let handle = manager.index("core", Direction::None).unwrap();
    let view = handle.lock().unwrap();
    let resolver = BindingResolver::new(&view);
    let one = resolver.find_exact("one", None).unwrap();
    assert_eq!(resolver.find_references(&one).len(), 1);
    assert_eq!(view.get_files(&LocationKey::workspace("core", "c.h")).len(), 1);
}

#[test]
fn test_full_reindex_keeps_identities() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "core/a.cpp",
        "namespace ns { int counter; }\nint bump() { return ++ns::counter; }\n",
    );
    let manager = IndexManager::with_components(
        workspace(dir.path(), vec![ProjectConfig::new("core", "core")]),
        Arc::new(TreeSitterFrontend::new()),
        Arc::new(FullStrategy),
    )
    .unwrap();

    let snapshot = |manager: &IndexManager| {
        let store = manager.fragment("core").unwrap();
        let data = store.acquire_read().unwrap();
        let ids: Vec<_> = data
            .find_bindings_by_exact_name(&["ns", "counter"], &Filter::all())
            .iter()
            .map(|b| (b.id, b.names.clone()))
            .collect();
        (ids, data.stats())
    };

    assert!(manager.reindex("core").unwrap());
    assert!(manager.join(Some(TIMEOUT)));
    let first = snapshot(&manager);
    assert_eq!(first.0.len(), 1);

    assert!(manager.reindex("core").unwrap());
    assert!(manager.join(Some(TIMEOUT)));
    assert_eq!(snapshot(&manager), first);
}

#[test]
fn test_index_survives_restart() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "core/a.c", "int a;\nint get(void) { return a; }\n");
    let config = workspace(dir.path(), vec![ProjectConfig::new("core", "core")]);

    let stats = {
        let manager = indexed(config.clone());
        let stats = manager.stats("core").unwrap();
        manager.shutdown();
        stats
    };
    assert_eq!(stats.files, 1);

    let manager = IndexManager::new(config).unwrap();
    assert_eq!(manager.stats("core").unwrap(), stats);
    assert!(!manager.reindex("core").unwrap());
}

#[test]
fn test_corrupt_fragment_is_rebuilt_on_open() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "core/a.c", "int a;\n");
    write(dir.path(), ".cxx-index/core.db", "definitely not sqlite");

    let manager = IndexManager::new(workspace(
        dir.path(),
        vec![ProjectConfig::new("core", "core")],
    ))
    .unwrap();
    assert_eq!(manager.stats("core").unwrap().files, 0);
    assert!(manager.reindex("core").unwrap());
    assert!(manager.join(Some(TIMEOUT)));
    assert_eq!(manager.stats("core").unwrap().files, 1);
}

#[test]
fn test_open_view_holds_back_writers() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "core/a.c", "int a;\n");
    let manager = indexed(workspace(dir.path(), vec![ProjectConfig::new("core", "core")]));

    let handle = manager.index("core", Direction::None).unwrap();
    let view = handle.lock().unwrap();
    let before = view.stats();

    let b = write(dir.path(), "core/b.c", "int b;\n");
    manager.handle_event(ResourceEvent::FileCreated(b)).unwrap();
    assert!(!manager.join(Some(Duration::from_millis(300))));
    assert_eq!(view.stats(), before);

    drop(view);
    assert!(manager.join(Some(TIMEOUT)));
    assert_eq!(manager.stats("core").unwrap().files, 2);
}

#[test]
fn test_project_description_change_reparses_with_new_defines() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "core/a.cpp",
        "#ifdef FEATURE\nint feature_on();\n#else\nint feature_off();\n#endif\n",
    );
    let manager = indexed(workspace(dir.path(), vec![ProjectConfig::new("core", "core")]));
    assert!(has_binding(&manager, "core", Direction::None, "feature_off"));

    manager
        .handle_event(ResourceEvent::ProjectChanged(
            ProjectConfig::new("core", "core").define("FEATURE", "1"),
        ))
        .unwrap();
    assert!(manager.join(Some(TIMEOUT)));
    assert!(has_binding(&manager, "core", Direction::None, "feature_on"));
    assert!(!has_binding(&manager, "core", Direction::None, "feature_off"));
}

#[test]
fn test_unit_macro_change_drops_header_variant_nobody_uses() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "core/h.h",
        "#ifdef A\nvoid foo();\n#else\nvoid bar();\n#endif\n",
    );
    let main = write(dir.path(), "core/main.cpp", "#define A\n#include \"h.h\"\n");
    let other = write(dir.path(), "core/other.cpp", "#define A\n#include \"h.h\"\n");
    let manager = indexed(workspace(dir.path(), vec![ProjectConfig::new("core", "core")]));
    let header = LocationKey::workspace("core", "h.h");
    let variants = |manager: &IndexManager| {
        let store = manager.fragment("core").unwrap();
        let data = store.acquire_read().unwrap();
        data.get_files(&header).len()
    };
    assert_eq!(variants(&manager), 1);

    // other.cpp still includes the variant with A defined
    rewrite(&main, "#include \"h.h\"\n");
    manager
        .handle_event(ResourceEvent::FileModified(main))
        .unwrap();
    assert!(manager.join(Some(TIMEOUT)));
    assert_eq!(variants(&manager), 2);
    assert!(has_binding(&manager, "core", Direction::None, "foo"));
    assert!(has_binding(&manager, "core", Direction::None, "bar"));

    rewrite(&other, "#include \"h.h\"\n");
    manager
        .handle_event(ResourceEvent::FileModified(other))
        .unwrap();
    assert!(manager.join(Some(TIMEOUT)));
    assert_eq!(variants(&manager), 1);
    assert!(!has_binding(&manager, "core", Direction::None, "foo"));
    assert!(has_binding(&manager, "core", Direction::None, "bar"));
    manager.fragment("core").unwrap().acquire_read().unwrap().check_integrity().unwrap();
}

#[test]
fn test_deleted_header_leaves_every_fragment_consistent() {
    let dir = TempDir::new().unwrap();
    let manager = chain(dir.path());
    let header = LocationKey::workspace("c", "c.h");
    for project in ["b", "c"] {
        let store = manager.fragment(project).unwrap();
        assert_eq!(store.acquire_read().unwrap().get_files(&header).len(), 1, "{}", project);
    }

    std::fs::remove_file(dir.path().join("c/c.h")).unwrap();
    manager
        .handle_event(ResourceEvent::FileDeleted(dir.path().join("c/c.h")))
        .unwrap();
    assert!(manager.join(Some(TIMEOUT)));

    for project in ["b", "c"] {
        let store = manager.fragment(project).unwrap();
        let data = store.acquire_read().unwrap();
        assert!(data.get_files(&header).is_empty(), "{}", project);
        data.check_integrity().unwrap();
    }
    {
        let store = manager.fragment("b").unwrap();
        let data = store.acquire_read().unwrap();
        let unit = data.get_files(&LocationKey::workspace("b", "b.cpp"));
        assert_eq!(unit.len(), 1);
        assert!(unit[0].includes.iter().all(|i| i.target.is_none()));
    }

    let handle = manager.index("c", Direction::DependedOnBy).unwrap();
    let view = handle.lock().unwrap();
    assert!(view.get_files(&header).is_empty());
    let resolver = BindingResolver::new(&view);
    let shared = resolver.find_exact("shared_c", Some("function")).unwrap();
    assert!(resolver.find_declarations(&shared).is_empty());
    assert_eq!(resolver.find_definitions(&shared).len(), 1);
    drop(view);
    assert!(has_binding(&manager, "b", Direction::None, "b_func"));
}
