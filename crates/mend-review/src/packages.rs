//! Maps changed files to workspace packages and expands the set to every
//! package that depends on them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use mend_core::{MendError, Result};
use serde::Deserialize;
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    pub name: String,
    pub id: String,
    pub manifest_path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct Metadata {
    pub packages: Vec<Package>,
    #[serde(default)]
    pub workspace_members: Vec<String>,
}

impl Metadata {
    /// Packages that are members of the workspace.
    pub fn workspace_packages(&self) -> Vec<&Package> {
        let members: BTreeSet<&str> = self.workspace_members.iter().map(String::as_str).collect();
        self.packages
            .iter()
            .filter(|p| members.contains(p.id.as_str()))
            .collect()
    }
}

/// Load `cargo metadata` for the workspace at `dir`.
pub async fn load_metadata(dir: &Path) -> Result<Metadata> {
    let out = Command::new("cargo")
        .args(["metadata", "--format-version", "1"])
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| MendError::Review(format!("failed to run cargo metadata: {e}")))?;
    if !out.status.success() {
        return Err(MendError::Review(format!(
            "cargo metadata failed: {}",
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    parse_metadata(&out.stdout)
}

pub fn parse_metadata(bytes: &[u8]) -> Result<Metadata> {
    serde_json::from_slice(bytes)
        .map_err(|e| MendError::Review(format!("failed to parse cargo metadata: {e}")))
}

/// Resolve changed files to (directly changed packages, all impacted
/// packages). The impacted set is the fixed-point closure of workspace
/// packages depending on any directly changed package.
pub fn packages_for_files(
    metadata: &Metadata,
    files: &[PathBuf],
) -> Result<(Vec<String>, Vec<String>)> {
    for f in files {
        if !f.is_absolute() {
            return Err(MendError::Review(format!(
                "path {} is not absolute",
                f.display()
            )));
        }
    }

    let members = metadata.workspace_packages();

    // A file belongs to the package with the longest manifest-dir prefix.
    let mut direct: BTreeSet<String> = BTreeSet::new();
    for file in files {
        let mut best: Option<(&Package, usize)> = None;
        for pkg in &members {
            let Some(pkg_dir) = pkg.manifest_path.parent() else {
                continue;
            };
            if file.starts_with(pkg_dir) {
                let depth = pkg_dir.components().count();
                if best.map(|(_, d)| depth > d).unwrap_or(true) {
                    best = Some((pkg, depth));
                }
            }
        }
        if let Some((pkg, _)) = best {
            direct.insert(pkg.name.clone());
        }
    }

    // Workspace dependency edges: dependent -> its workspace deps.
    let member_names: BTreeSet<&str> = members.iter().map(|p| p.name.as_str()).collect();
    let mut dep_edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for pkg in &members {
        let deps: Vec<&str> = pkg
            .dependencies
            .iter()
            .filter(|d| d.path.is_some() || member_names.contains(d.name.as_str()))
            .map(|d| d.name.as_str())
            .collect();
        dep_edges.insert(&pkg.name, deps);
    }

    // Fixed point: add any package that depends on an impacted package.
    let mut all: BTreeSet<String> = direct.clone();
    loop {
        let mut changed = false;
        for pkg in &members {
            if all.contains(&pkg.name) {
                continue;
            }
            let depends_on_impacted = dep_edges
                .get(pkg.name.as_str())
                .map(|deps| deps.iter().any(|d| all.contains(*d)))
                .unwrap_or(false);
            if depends_on_impacted {
                all.insert(pkg.name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    Ok((direct.into_iter().collect(), all.into_iter().collect()))
}

/// Extract the package name from a cargo package id.
///
/// Handles both the modern `path+file:///...#name@0.1.0` spec format and
/// the legacy `name 0.1.0 (path+file:///...)` format.
pub fn package_name_from_id(id: &str) -> String {
    if let Some(frag) = id.split('#').nth(1) {
        if let Some((name, _version)) = frag.split_once('@') {
            return name.to_string();
        }
        // A bare-version fragment (`.../name#0.1.0`) names the package
        // in its last path segment instead.
        if frag.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            let before_hash = id.split('#').next().unwrap_or(id);
            return before_hash.rsplit('/').next().unwrap_or(id).to_string();
        }
        return frag.to_string();
    }
    if let Some(name) = id.split(' ').next() {
        if !name.is_empty() && !name.contains("://") {
            return name.to_string();
        }
    }
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_metadata() -> Metadata {
        let json = r#"{
            "packages": [
                {
                    "name": "core",
                    "id": "path+file:///ws/core#core@0.1.0",
                    "manifest_path": "/ws/core/Cargo.toml",
                    "dependencies": []
                },
                {
                    "name": "engine",
                    "id": "path+file:///ws/engine#engine@0.1.0",
                    "manifest_path": "/ws/engine/Cargo.toml",
                    "dependencies": [{"name": "core", "path": "/ws/core"}]
                },
                {
                    "name": "cli",
                    "id": "path+file:///ws/cli#cli@0.1.0",
                    "manifest_path": "/ws/cli/Cargo.toml",
                    "dependencies": [{"name": "engine", "path": "/ws/engine"}]
                },
                {
                    "name": "serde",
                    "id": "registry+https://github.com/rust-lang/crates.io-index#serde@1.0.0",
                    "manifest_path": "/home/x/.cargo/registry/serde/Cargo.toml",
                    "dependencies": []
                }
            ],
            "workspace_members": [
                "path+file:///ws/core#core@0.1.0",
                "path+file:///ws/engine#engine@0.1.0",
                "path+file:///ws/cli#cli@0.1.0"
            ]
        }"#;
        parse_metadata(json.as_bytes()).unwrap()
    }

    #[test]
    fn direct_package_resolution_uses_longest_prefix() {
        let md = fake_metadata();
        let (direct, _) =
            packages_for_files(&md, &[PathBuf::from("/ws/engine/src/lib.rs")]).unwrap();
        assert_eq!(direct, vec!["engine"]);
    }

    #[test]
    fn closure_includes_transitive_dependents() {
        let md = fake_metadata();
        let (direct, all) =
            packages_for_files(&md, &[PathBuf::from("/ws/core/src/lib.rs")]).unwrap();
        assert_eq!(direct, vec!["core"]);
        // engine depends on core, cli depends on engine.
        assert_eq!(all, vec!["cli", "core", "engine"]);
    }

    #[test]
    fn non_workspace_files_resolve_to_nothing() {
        let md = fake_metadata();
        let (direct, all) =
            packages_for_files(&md, &[PathBuf::from("/elsewhere/file.rs")]).unwrap();
        assert!(direct.is_empty());
        assert!(all.is_empty());
    }

    #[test]
    fn relative_paths_are_rejected() {
        let md = fake_metadata();
        assert!(packages_for_files(&md, &[PathBuf::from("src/lib.rs")]).is_err());
    }

    #[test]
    fn package_name_parsing() {
        assert_eq!(
            package_name_from_id("path+file:///ws/core#core@0.1.0"),
            "core"
        );
        assert_eq!(
            package_name_from_id("registry+https://github.com/rust-lang/crates.io-index#serde@1.0.0"),
            "serde"
        );
        assert_eq!(
            package_name_from_id("core 0.1.0 (path+file:///ws/core)"),
            "core"
        );
        assert_eq!(package_name_from_id("path+file:///ws/thing#0.1.0"), "thing");
    }
}
