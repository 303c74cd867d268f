use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use cxx_indexer::error::{IndexerError, Result};
use cxx_indexer::index::{CompositeBinding, CompositeView, Filter, NameRole};
use cxx_indexer::indexer::{BindingResolver, FileWatcher, ResourceEvent};
use cxx_indexer::location::LocationKey;
use cxx_indexer::manager::{IndexHandle, IndexManager};
use cxx_indexer::project::Direction;

#[derive(Parser)]
#[command(name = "cxx-indexer")]
#[command(about = "Persistent incremental symbol index for C/C++ workspaces")]
#[command(version)]
#[command(after_long_help = r#"
EXAMPLES:
    # Index every project of cxx-index.toml
    cxx-indexer index

    # Keep the index current while editing
    cxx-indexer index --watch

    # Bindings whose name matches a pattern, across app and its dependencies
    cxx-indexer search "ns::Wid.*" --project app --direction depends-on

    # Where a function is declared, defined and used
    cxx-indexer refs "ns::Widget::draw" --project app

    # Move an index between machines
    cxx-indexer export core core.snapshot --portable
    cxx-indexer import core core.snapshot
"#)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the workspace configuration
    #[arg(long, default_value = "cxx-index.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bring the index of every project up to date
    Index {
        /// Only this project
        #[arg(long)]
        project: Option<String>,

        /// Watch for file changes and update the index
        #[arg(long)]
        watch: bool,
    },

    /// Search bindings by qualified-name pattern
    Search {
        /// Pattern such as `ns::Wid.*`; each part is a regex over one name component
        pattern: String,

        /// Project to search from (all projects when omitted)
        #[arg(long)]
        project: Option<String>,

        /// none, depends-on, depended-on-by or both
        #[arg(long, default_value = "none")]
        direction: String,

        /// Case-insensitive prefix of the last name component
        #[arg(long, conflicts_with = "exact")]
        prefix: bool,

        /// Fully qualified name
        #[arg(long)]
        exact: bool,

        /// Only bindings at global scope
        #[arg(long)]
        global: bool,

        /// Maximum number of results
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Declarations, definitions and references of one binding
    Refs {
        /// Fully qualified name, e.g. `ns::Widget::draw`
        name: String,

        /// Kind tag to disambiguate, e.g. `function`
        #[arg(long)]
        kind: Option<String>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value = "both")]
        direction: String,
    },

    /// Show index statistics
    Stats,

    /// Write a snapshot of one project
    Export {
        project: String,
        file: PathBuf,

        /// Store paths relative to the project root
        #[arg(long)]
        portable: bool,
    },

    /// Replace the index of one project with a snapshot
    Import { project: String, file: PathBuf },
}

pub fn parse_direction(raw: &str) -> Result<Direction> {
    Direction::from_str(raw)
        .ok_or_else(|| IndexerError::Config(format!("unknown direction: {}", raw)))
}

fn handle_for(manager: &IndexManager, project: Option<&str>, direction: Direction) -> Result<IndexHandle> {
    match project {
        Some(project) => manager.index(project, direction),
        None => manager.index_for(&manager.projects()),
    }
}

pub fn index_workspace(config: &Path, project: Option<&str>, watch: bool) -> Result<()> {
    let manager = IndexManager::open(config)?;
    let projects = match project {
        Some(p) => vec![p.to_string()],
        None => manager.projects(),
    };
    if projects.is_empty() {
        println!("No projects configured in {}", config.display());
        return Ok(());
    }

    for project in &projects {
        manager.reindex(project)?;
    }
    wait_with_progress(&manager);

    for project in &projects {
        let stats = manager.stats(project)?;
        println!(
            "{}: {} files, {} bindings, {} names{}",
            project,
            stats.files,
            stats.bindings,
            stats.names,
            if stats.failed_files > 0 {
                format!(", {} failed", stats.failed_files)
            } else {
                String::new()
            }
        );
    }

    if watch {
        let roots: Vec<PathBuf> = projects
            .iter()
            .filter_map(|p| manager.project_config(p))
            .map(|c| manager.root().join(&c.root))
            .collect();
        let mut watcher = FileWatcher::new(&roots)?;
        for project in &projects {
            let store = manager.fragment(project)?;
            let data = store.acquire_read()?;
            watcher.seed(data.locations().filter_map(|l| manager.path_of(l)));
        }
        println!("Watching for changes...");

        while let Some(events) = watcher.recv() {
            for event in events {
                let path = match &event {
                    ResourceEvent::FileCreated(p)
                    | ResourceEvent::FileModified(p)
                    | ResourceEvent::FileDeleted(p) => p.clone(),
                    _ => continue,
                };
                if let Err(e) = manager.handle_event(event) {
                    eprintln!("Failed to update {}: {}", path.display(), e);
                }
            }
            manager.join(None);
            println!("Index updated");
        }
    }

    manager.shutdown();
    Ok(())
}

fn wait_with_progress(manager: &IndexManager) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} files {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    while !manager.join(Some(Duration::from_millis(100))) {
        let snapshot = manager.progress().snapshot();
        bar.set_length(snapshot.files_total as u64);
        bar.set_position(snapshot.files_processed as u64);
        bar.set_message(format!("{} names", snapshot.names_indexed));
    }
    bar.finish_and_clear();
}

#[allow(clippy::too_many_arguments)]
pub fn search(
    config: &Path,
    pattern: &str,
    project: Option<&str>,
    direction: &str,
    prefix: bool,
    exact: bool,
    global: bool,
    limit: usize,
) -> Result<()> {
    let manager = IndexManager::open(config)?;
    let handle = handle_for(&manager, project, parse_direction(direction)?)?;
    let view = handle.lock()?;
    let resolver = BindingResolver::new(&view);
    let filter = Filter::all();

    let bindings = if exact {
        let components: Vec<&str> = pattern.trim_start_matches("::").split("::").collect();
        view.find_bindings_by_exact_name(&components, &filter)
    } else if prefix {
        view.find_bindings_by_prefix(pattern, global, &filter)
    } else {
        resolver.find_bindings(pattern, global, &filter)?
    };

    if bindings.is_empty() {
        println!("No bindings match {}", pattern);
        return Ok(());
    }
    for binding in bindings.iter().take(limit) {
        print_binding(&manager, &resolver, binding);
    }
    if bindings.len() > limit {
        println!("... {} more", bindings.len() - limit);
    }
    Ok(())
}

fn print_binding(manager: &IndexManager, resolver: &BindingResolver<'_, '_>, binding: &CompositeBinding) {
    let mut names = resolver.find_definitions(binding);
    if names.is_empty() {
        names = resolver.find_declarations(binding);
    }
    let location = names
        .first()
        .map(|n| describe(manager, n.location, n.record.offset))
        .unwrap_or_default();
    println!(
        "{} ({}, {}) {}",
        binding.qualified(),
        binding.key.tag,
        binding.key.linkage.as_str(),
        location
    );
}

pub fn refs(
    config: &Path,
    name: &str,
    kind: Option<&str>,
    project: Option<&str>,
    direction: &str,
) -> Result<()> {
    let manager = IndexManager::open(config)?;
    let handle = handle_for(&manager, project, parse_direction(direction)?)?;
    let view: CompositeView<'_> = handle.lock()?;
    let resolver = BindingResolver::new(&view);
    let binding = resolver.find_exact(name, kind)?;

    println!("{} ({})", binding.qualified(), binding.key.tag);
    for role in [NameRole::Declaration, NameRole::Definition, NameRole::Reference] {
        let names = match role {
            NameRole::Declaration => resolver.find_declarations(&binding),
            NameRole::Definition => resolver.find_definitions(&binding),
            NameRole::Reference => resolver.find_references(&binding),
        };
        if names.is_empty() {
            continue;
        }
        println!("  {}s:", role.as_str());
        for n in names {
            let mut line = format!("    {}", describe(&manager, n.location, n.record.offset));
            if n.record.is_write {
                line.push_str(" [write]");
            }
            if n.record.could_be_polymorphic {
                line.push_str(" [polymorphic]");
            }
            if let Some(enclosing) = resolver.enclosing_definition(&n) {
                if let Some(b) = resolver.binding_of(&enclosing) {
                    line.push_str(&format!(" in {}", b.qualified()));
                }
            }
            println!("{}", line);
        }
    }
    Ok(())
}

/// `path:line:column` when the file is readable, the key and offset otherwise.
fn describe(manager: &IndexManager, location: &LocationKey, offset: u32) -> String {
    let Some(path) = manager.path_of(location) else {
        return format!("{}@{}", location, offset);
    };
    match std::fs::read(&path) {
        Ok(bytes) => {
            let end = (offset as usize).min(bytes.len());
            let before = &bytes[..end];
            let line = before.iter().filter(|b| **b == b'\n').count() + 1;
            let column = end - before.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0) + 1;
            format!("{}:{}:{}", path.display(), line, column)
        }
        Err(_) => format!("{}@{}", path.display(), offset),
    }
}

pub fn show_stats(config: &Path) -> Result<()> {
    let manager = IndexManager::open(config)?;
    println!("Index Statistics:");
    for project in manager.projects() {
        let stats = manager.stats(&project)?;
        println!("  {}:", project);
        println!("    Files: {}", stats.files);
        println!("    Bindings: {}", stats.bindings);
        println!("    Names: {}", stats.names);
        if stats.failed_files > 0 {
            println!("    Failed files: {}", stats.failed_files);
        }
    }
    Ok(())
}

pub fn export(config: &Path, project: &str, file: &Path, portable: bool) -> Result<()> {
    let manager = IndexManager::open(config)?;
    let header = manager.export(project, file, portable)?;
    println!(
        "Exported {} to {} (snapshot {})",
        project,
        file.display(),
        header.snapshot_id
    );
    Ok(())
}

pub fn import(config: &Path, project: &str, file: &Path) -> Result<()> {
    let manager = IndexManager::open(config)?;
    let header = manager.import(project, file)?;
    println!(
        "Imported snapshot {} of {} into {}, refreshing stale files",
        header.snapshot_id, header.project, project
    );
    wait_with_progress(&manager);
    manager.shutdown();
    Ok(())
}
