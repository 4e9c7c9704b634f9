//! Locating the coordinator and worker executables
//!
//! Search order: explicit override, `PATH`, conventional install
//! directories, then `target/release` and `target/debug` under the
//! repository root. The first existing executable wins.

use crate::supervisor::Role;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a binary was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarySource {
    Override,
    SearchPath,
    InstallDir,
    BuildOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBinary {
    pub path: PathBuf,
    pub source: BinarySource,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(
        "Could not find the {role} binary '{name}'. Build it with `{build_command}` or set {env_var} to its path."
    )]
    NotFound {
        role: Role,
        name: String,
        build_command: String,
        env_var: &'static str,
        searched: Vec<PathBuf>,
    },
}

/// Search locations for one binary
#[derive(Debug, Clone, Default)]
pub struct BinaryLocator {
    pub override_path: Option<PathBuf>,
    /// Value searched like `PATH`; `None` skips the search
    pub search_path: Option<OsString>,
    pub home_dir: Option<PathBuf>,
    pub system_dirs: Vec<PathBuf>,
    pub repo_root: Option<PathBuf>,
}

impl BinaryLocator {
    /// Locator over the real environment
    pub fn from_env(override_path: Option<PathBuf>, repo_root: Option<PathBuf>) -> Self {
        let repo_root = repo_root.or_else(|| {
            let from_cwd = std::env::current_dir().ok().and_then(|d| discover_repo_root(&d));
            from_cwd.or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().and_then(discover_repo_root))
            })
        });

        Self {
            override_path,
            search_path: std::env::var_os("PATH"),
            home_dir: dirs_next::home_dir(),
            system_dirs: default_system_dirs(),
            repo_root,
        }
    }

    pub fn repo_root(&self) -> Option<&Path> {
        self.repo_root.as_deref()
    }

    /// Candidate paths in search order, excluding the `PATH` lookup
    fn fixed_candidates(&self, file_name: &str) -> Vec<(BinarySource, PathBuf)> {
        let mut candidates = Vec::new();

        if let Some(home) = &self.home_dir {
            for dir in [".cargo/bin", ".local/bin", "bin"] {
                candidates.push((BinarySource::InstallDir, home.join(dir).join(file_name)));
            }
        }
        for dir in &self.system_dirs {
            candidates.push((BinarySource::InstallDir, dir.join(file_name)));
        }
        if let Some(root) = &self.repo_root {
            for profile in ["release", "debug"] {
                candidates.push((
                    BinarySource::BuildOutput,
                    root.join("target").join(profile).join(file_name),
                ));
            }
        }

        candidates
    }

    /// Find the executable for `role` named `name`.
    ///
    /// Touches the filesystem; call from a blocking context.
    pub fn locate(&self, role: Role, name: &str) -> Result<LocatedBinary, DiscoveryError> {
        let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
        let mut searched = Vec::new();

        if let Some(path) = &self.override_path {
            if is_executable(path) {
                return Ok(LocatedBinary {
                    path: path.clone(),
                    source: BinarySource::Override,
                });
            }
            warn!(role = %role, path = %path.display(), "Configured binary override is missing or not executable");
            searched.push(path.clone());
        }

        if let Some(search_path) = &self.search_path {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if let Ok(path) = which::which_in(&file_name, Some(search_path), cwd) {
                if is_executable(&path) {
                    return Ok(LocatedBinary {
                        path,
                        source: BinarySource::SearchPath,
                    });
                }
            }
        }

        for (source, path) in self.fixed_candidates(&file_name) {
            if is_executable(&path) {
                debug!(role = %role, path = %path.display(), ?source, "Located binary");
                return Ok(LocatedBinary { path, source });
            }
            searched.push(path);
        }

        Err(DiscoveryError::NotFound {
            role,
            name: name.to_string(),
            build_command: format!("cargo build --release --bin {}", name),
            env_var: role.binary_env_var(),
            searched,
        })
    }
}

fn default_system_dirs() -> Vec<PathBuf> {
    if cfg!(unix) {
        ["/usr/local/bin", "/usr/bin", "/opt/homebrew/bin"]
            .iter()
            .map(PathBuf::from)
            .collect()
    } else {
        Vec::new()
    }
}

/// Nearest ancestor of `start` whose Cargo.toml declares a workspace
pub fn discover_repo_root(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        let manifest = dir.join("Cargo.toml");
        let content = std::fs::read_to_string(&manifest).ok()?;
        content
            .lines()
            .any(|l| l.trim() == "[workspace]")
            .then(|| dir.to_path_buf())
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_exe(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn empty_locator() -> BinaryLocator {
        BinaryLocator::default()
    }

    #[test]
    fn test_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom/proof-worker");
        make_exe(&explicit);
        make_exe(&dir.path().join("target/release/proof-worker"));

        let locator = BinaryLocator {
            override_path: Some(explicit.clone()),
            repo_root: Some(dir.path().to_path_buf()),
            ..empty_locator()
        };
        let found = locator.locate(Role::Worker, "proof-worker").unwrap();
        assert_eq!(found.path, explicit);
        assert_eq!(found.source, BinarySource::Override);
    }

    #[test]
    fn test_missing_override_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let built = dir.path().join("target/debug/proof-worker");
        make_exe(&built);

        let locator = BinaryLocator {
            override_path: Some(dir.path().join("nope/proof-worker")),
            repo_root: Some(dir.path().to_path_buf()),
            ..empty_locator()
        };
        let found = locator.locate(Role::Worker, "proof-worker").unwrap();
        assert_eq!(found.path, built);
        assert_eq!(found.source, BinarySource::BuildOutput);
    }

    #[test]
    fn test_search_path_before_install_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let on_path = dir.path().join("pathdir/proof-coordinator");
        make_exe(&on_path);
        make_exe(&dir.path().join("home/.cargo/bin/proof-coordinator"));

        let locator = BinaryLocator {
            search_path: Some(dir.path().join("pathdir").into_os_string()),
            home_dir: Some(dir.path().join("home")),
            ..empty_locator()
        };
        let found = locator.locate(Role::Coordinator, "proof-coordinator").unwrap();
        assert_eq!(found.path, on_path);
        assert_eq!(found.source, BinarySource::SearchPath);
    }

    #[test]
    fn test_home_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        let installed = dir.path().join(".local/bin/proof-coordinator");
        make_exe(&installed);

        let locator = BinaryLocator {
            home_dir: Some(dir.path().to_path_buf()),
            ..empty_locator()
        };
        let found = locator.locate(Role::Coordinator, "proof-coordinator").unwrap();
        assert_eq!(found.path, installed);
        assert_eq!(found.source, BinarySource::InstallDir);
    }

    #[test]
    fn test_release_preferred_over_debug() {
        let dir = tempfile::tempdir().unwrap();
        make_exe(&dir.path().join("target/debug/proof-worker"));
        make_exe(&dir.path().join("target/release/proof-worker"));

        let locator = BinaryLocator {
            repo_root: Some(dir.path().to_path_buf()),
            ..empty_locator()
        };
        let found = locator.locate(Role::Worker, "proof-worker").unwrap();
        assert!(found.path.ends_with("target/release/proof-worker"));
    }

    #[test]
    fn test_non_executable_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("target/release/proof-worker");
        std::fs::create_dir_all(plain.parent().unwrap()).unwrap();
        std::fs::write(&plain, "not a program").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();

        let locator = BinaryLocator {
            repo_root: Some(dir.path().to_path_buf()),
            ..empty_locator()
        };
        assert!(locator.locate(Role::Worker, "proof-worker").is_err());
    }

    #[test]
    fn test_not_found_names_build_command() {
        let dir = tempfile::tempdir().unwrap();
        let locator = BinaryLocator {
            repo_root: Some(dir.path().to_path_buf()),
            ..empty_locator()
        };

        let err = locator.locate(Role::Coordinator, "proof-coordinator").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cargo build --release --bin proof-coordinator"));
        assert!(message.contains("COORDINATOR_BIN"));
        let DiscoveryError::NotFound { searched, .. } = err;
        assert_eq!(searched.len(), 2);
    }

    #[test]
    fn test_discover_repo_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[workspace]\nmembers = [\"crates/*\"]\n",
        )
        .unwrap();
        let nested = dir.path().join("crates/gateway/src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            dir.path().join("crates/gateway/Cargo.toml"),
            "[package]\nname = \"gateway\"\n",
        )
        .unwrap();

        assert_eq!(discover_repo_root(&nested), Some(dir.path().to_path_buf()));
    }
}
