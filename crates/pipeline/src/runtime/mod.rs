//! Launching a built image
//!
//! There is no isolation layer: the image's root filesystem is materialised
//! into a private directory and the entrypoint runs as a host process with
//! its working directory inside that root. The environment is rebuilt from
//! the image config alone; nothing leaks in from the caller's shell.

mod launch;

pub use launch::{launch, ExitOutcome};

use crate::pipeline::phases::dependencies::INSTALL_PREFIX;
use crate::store::LayerStore;
use anyhow::{bail, Context, Result};
use slipway_core::image::{BuiltImage, ImageConfig};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Caller-supplied replacements applied at launch time only
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    /// Replaces the whole entrypoint when set
    pub argv: Option<Vec<String>>,
    /// Added on top of the image environment, winning on conflicts
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

/// Fully resolved description of the one process a launch starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Absolute path inside the image
    pub workdir: String,
}

impl LaunchSpec {
    /// Merge, lowest priority first: base image env, image config env, overrides
    pub fn resolve(
        config: &ImageConfig,
        base_env: &BTreeMap<String, String>,
        overrides: &RunOverrides,
    ) -> Result<Self> {
        let argv = overrides
            .argv
            .clone()
            .unwrap_or_else(|| config.entrypoint.clone());
        if argv.first().map_or(true, |program| program.is_empty()) {
            bail!("Nothing to run: the image has no entrypoint and no command was given");
        }

        let mut env = base_env.clone();
        env.extend(config.env.clone());
        env.extend(overrides.env.clone());

        let workdir = overrides
            .workdir
            .clone()
            .unwrap_or_else(|| config.workdir.clone());
        let workdir = if workdir.is_empty() {
            "/".to_string()
        } else {
            workdir
        };
        if !workdir.starts_with('/') {
            bail!("Working directory must be absolute: {}", workdir);
        }

        Ok(Self { argv, env, workdir })
    }

    /// Host path of the working directory for an image materialised at `root`
    pub fn host_workdir(&self, root: &Path) -> PathBuf {
        root.join(self.workdir.trim_start_matches('/'))
    }

    /// The child process, not yet spawned.
    ///
    /// The argument vector is passed as-is with no shell in between. `PATH`
    /// keeps its entries but each is preceded by its counterpart under
    /// `root`, so programs installed into the image are found first.
    /// `PYTHONPATH` is prefixed the same way, led by the site-packages
    /// directories the dependency step installed under `root`.
    pub fn command(&self, root: &Path) -> tokio::process::Command {
        let program = rooted_program(root, &self.argv[0]);
        let mut command = tokio::process::Command::new(program);
        command
            .args(&self.argv[1..])
            .env_clear()
            .envs(&self.env)
            .current_dir(self.host_workdir(root));
        if let Some(path) = self.env.get("PATH") {
            command.env("PATH", rooted_search_path(root, path));
        }
        if let Some(python_path) = python_path(root, self.env.get("PYTHONPATH")) {
            command.env("PYTHONPATH", python_path);
        }
        command
    }
}

fn rooted_program(root: &Path, program: &str) -> OsString {
    if program.starts_with('/') {
        let inside = root.join(program.trim_start_matches('/'));
        if inside.is_file() {
            return inside.into_os_string();
        }
    }
    OsString::from(program)
}

fn rooted_entries(root: &Path, path: &str) -> Vec<PathBuf> {
    let entries = path.split(':').filter(|e| !e.is_empty());
    let rooted = entries
        .clone()
        .filter(|e| e.starts_with('/'))
        .map(|e| root.join(e.trim_start_matches('/')));
    rooted.chain(entries.map(PathBuf::from)).collect()
}

fn rooted_search_path(root: &Path, path: &str) -> OsString {
    std::env::join_paths(rooted_entries(root, path)).unwrap_or_else(|_| OsString::from(path))
}

/// Package directories under the install prefix, in sorted order.
///
/// Covers `lib/pythonX.Y/{site,dist}-packages`, the Debian `local/` variant
/// and the flat `lib/site-packages` some installers use.
fn rooted_site_packages(root: &Path) -> Vec<PathBuf> {
    let prefix = root.join(INSTALL_PREFIX.trim_start_matches('/'));
    let mut found = Vec::new();
    for lib in [prefix.join("lib"), prefix.join("local/lib")] {
        let mut versions: Vec<PathBuf> = match fs::read_dir(&lib) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map_or(false, |name| name.starts_with("python"))
                })
                .collect(),
            Err(_) => continue,
        };
        versions.sort();
        for version in versions {
            for leaf in ["site-packages", "dist-packages"] {
                let candidate = version.join(leaf);
                if candidate.is_dir() {
                    found.push(candidate);
                }
            }
        }
        let flat = lib.join("site-packages");
        if flat.is_dir() {
            found.push(flat);
        }
    }
    found
}

fn python_path(root: &Path, existing: Option<&String>) -> Option<OsString> {
    let mut entries = rooted_site_packages(root);
    if let Some(existing) = existing {
        entries.extend(rooted_entries(root, existing));
    }
    if entries.is_empty() {
        return None;
    }
    std::env::join_paths(entries).ok()
}

/// Extract every layer of `image` into a fresh private directory
pub fn materialise(store: &LayerStore, image: &BuiltImage) -> Result<TempDir> {
    let root = tempfile::Builder::new()
        .prefix("slipway-run-")
        .tempdir()
        .context("Failed to create launch root")?;
    store.export_rootfs(&image.layers, root.path())?;

    let spec_workdir = root.path().join(image.config.workdir.trim_start_matches('/'));
    std::fs::create_dir_all(&spec_workdir)
        .with_context(|| format!("Failed to create {}", spec_workdir.display()))?;

    debug!(image = %image.name, root = %root.path().display(), "Materialised image");
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::descriptor::ExposedPort;

    fn config() -> ImageConfig {
        ImageConfig {
            workdir: "/app".to_string(),
            env: BTreeMap::from([
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("LANG".to_string(), "C.UTF-8".to_string()),
            ]),
            exposed_ports: [ExposedPort::tcp(5000)].into_iter().collect(),
            entrypoint: vec!["python".to_string(), "app.py".to_string()],
        }
    }

    fn base_env() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
            ("LANG".to_string(), "C".to_string()),
        ])
    }

    #[test]
    fn test_default_launch() {
        let spec = LaunchSpec::resolve(&config(), &base_env(), &RunOverrides::default()).unwrap();
        assert_eq!(spec.argv, vec!["python", "app.py"]);
        assert_eq!(spec.workdir, "/app");
        assert_eq!(spec.env["PYTHONUNBUFFERED"], "1");
        assert_eq!(spec.env["LANG"], "C.UTF-8");
        assert_eq!(spec.env["PATH"], "/usr/local/bin:/usr/bin:/bin");
        assert!(!spec.env.contains_key("HOST"));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = RunOverrides {
            argv: Some(vec!["python".to_string(), "-m".to_string(), "pytest".to_string()]),
            env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "0".to_string())]),
            workdir: Some("/srv".to_string()),
        };
        let spec = LaunchSpec::resolve(&config(), &base_env(), &overrides).unwrap();
        assert_eq!(spec.argv, vec!["python", "-m", "pytest"]);
        assert_eq!(spec.env["PYTHONUNBUFFERED"], "0");
        assert_eq!(spec.workdir, "/srv");
    }

    #[test]
    fn test_no_entrypoint_is_error() {
        let mut config = config();
        config.entrypoint.clear();
        assert!(LaunchSpec::resolve(&config, &base_env(), &RunOverrides::default()).is_err());
    }

    #[test]
    fn test_relative_workdir_override_rejected() {
        let overrides = RunOverrides {
            workdir: Some("app".to_string()),
            ..RunOverrides::default()
        };
        assert!(LaunchSpec::resolve(&config(), &base_env(), &overrides).is_err());
    }

    #[test]
    fn test_search_path_prefers_image() {
        let path = rooted_search_path(Path::new("/tmp/root"), "/usr/local/bin:/bin");
        assert_eq!(
            path,
            OsString::from("/tmp/root/usr/local/bin:/tmp/root/bin:/usr/local/bin:/bin")
        );
    }

    fn command_env(command: &tokio::process::Command, key: &str) -> Option<OsString> {
        command
            .as_std()
            .get_envs()
            .find(|(name, _)| name.to_str() == Some(key))
            .and_then(|(_, value)| value.map(|v| v.to_os_string()))
    }

    #[test]
    fn test_python_path_reaches_installed_packages() {
        let root = TempDir::new().unwrap();
        let site = root.path().join("usr/local/lib/python3.11/site-packages");
        std::fs::create_dir_all(site.join("flask")).unwrap();
        let flat = root.path().join("usr/local/lib/site-packages");
        std::fs::create_dir_all(&flat).unwrap();

        let mut spec =
            LaunchSpec::resolve(&config(), &base_env(), &RunOverrides::default()).unwrap();
        spec.env.insert("PYTHONPATH".to_string(), "/app/src".to_string());

        let value = command_env(&spec.command(root.path()), "PYTHONPATH").unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&value).collect();
        assert_eq!(
            entries,
            vec![
                site,
                flat,
                root.path().join("app/src"),
                PathBuf::from("/app/src")
            ]
        );
    }

    #[test]
    fn test_python_path_absent_without_packages() {
        let root = TempDir::new().unwrap();
        let spec = LaunchSpec::resolve(&config(), &base_env(), &RunOverrides::default()).unwrap();
        assert!(command_env(&spec.command(root.path()), "PYTHONPATH").is_none());
    }

    #[test]
    fn test_absolute_program_inside_root() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("usr/local/bin")).unwrap();
        std::fs::write(root.path().join("usr/local/bin/gunicorn"), "").unwrap();

        assert_eq!(
            rooted_program(root.path(), "/usr/local/bin/gunicorn"),
            root.path().join("usr/local/bin/gunicorn").into_os_string()
        );
        assert_eq!(rooted_program(root.path(), "/bin/sh"), OsString::from("/bin/sh"));
        assert_eq!(rooted_program(root.path(), "python"), OsString::from("python"));
    }
}
