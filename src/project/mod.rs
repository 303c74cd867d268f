//! Project model: project identities and the dependency graph used to
//! compose fragments.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which neighbours of a project a composite view includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The project alone.
    #[default]
    None,
    /// Plus everything it depends on, transitively.
    DependsOn,
    /// Plus everything that depends on it, transitively.
    DependedOnBy,
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::None => "none",
            Direction::DependsOn => "depends_on",
            Direction::DependedOnBy => "depended_on_by",
            Direction::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Some(Direction::None),
            "depends_on" => Some(Direction::DependsOn),
            "depended_on_by" => Some(Direction::DependedOnBy),
            "both" => Some(Direction::Both),
            _ => None,
        }
    }

    fn forward(self) -> bool {
        matches!(self, Direction::DependsOn | Direction::Both)
    }

    fn backward(self) -> bool {
        matches!(self, Direction::DependedOnBy | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed "depends on" edges between named projects.
#[derive(Debug, Clone, Default)]
pub struct ProjectGraph {
    depends_on: BTreeMap<String, BTreeSet<String>>,
    depended_on_by: BTreeMap<String, BTreeSet<String>>,
}

impl ProjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&mut self, project: &str) {
        self.depends_on.entry(project.to_string()).or_default();
        self.depended_on_by.entry(project.to_string()).or_default();
    }

    /// Records that `project` depends on `dependency`.
    pub fn add_dependency(&mut self, project: &str, dependency: &str) {
        self.add_project(project);
        self.add_project(dependency);
        if let Some(deps) = self.depends_on.get_mut(project) {
            deps.insert(dependency.to_string());
        }
        if let Some(users) = self.depended_on_by.get_mut(dependency) {
            users.insert(project.to_string());
        }
    }

    /// Replaces the outgoing edges of `project`.
    pub fn set_dependencies<S: AsRef<str>>(&mut self, project: &str, dependencies: &[S]) {
        let old: Vec<String> = self
            .depends_on
            .get(project)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        for dep in old {
            if let Some(users) = self.depended_on_by.get_mut(&dep) {
                users.remove(project);
            }
        }
        self.add_project(project);
        if let Some(deps) = self.depends_on.get_mut(project) {
            deps.clear();
        }
        for dep in dependencies {
            self.add_dependency(project, dep.as_ref());
        }
    }

    /// Drops a project and every edge touching it.
    pub fn remove_project(&mut self, project: &str) {
        if let Some(deps) = self.depends_on.remove(project) {
            for dep in deps {
                if let Some(users) = self.depended_on_by.get_mut(&dep) {
                    users.remove(project);
                }
            }
        }
        if let Some(users) = self.depended_on_by.remove(project) {
            for user in users {
                if let Some(deps) = self.depends_on.get_mut(&user) {
                    deps.remove(project);
                }
            }
        }
    }

    pub fn contains(&self, project: &str) -> bool {
        self.depends_on.contains_key(project)
    }

    pub fn projects(&self) -> impl Iterator<Item = &str> {
        self.depends_on.keys().map(String::as_str)
    }

    pub fn dependencies(&self, project: &str) -> Vec<&str> {
        self.depends_on
            .get(project)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, project: &str) -> Vec<&str> {
        self.depended_on_by
            .get(project)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// `root` plus the projects reachable in `direction`. Cycles are
    /// tolerated; each project appears once, `root` first.
    pub fn closure(&self, root: &str, direction: Direction) -> Vec<String> {
        let mut out = vec![root.to_string()];
        let mut seen: BTreeSet<String> = BTreeSet::from([root.to_string()]);
        if direction.forward() {
            walk(root, &self.depends_on, &mut seen, &mut out);
        }
        if direction.backward() {
            walk(root, &self.depended_on_by, &mut seen, &mut out);
        }
        out
    }
}

/// Breadth-first walk over `edges` from `root`, appending unseen projects.
fn walk(
    root: &str,
    edges: &BTreeMap<String, BTreeSet<String>>,
    seen: &mut BTreeSet<String>,
    out: &mut Vec<String>,
) {
    let mut visited: BTreeSet<&str> = BTreeSet::from([root]);
    let mut queue: VecDeque<&str> = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for next in edges.get(current).into_iter().flatten() {
            if !visited.insert(next.as_str()) {
                continue;
            }
            queue.push_back(next.as_str());
            if seen.insert(next.clone()) {
                out.push(next.clone());
            }
        }
    }
}
