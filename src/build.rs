//! Application build driver and per-project build cache.
//!
//! The application is built at most once per project key for the life of
//! the backend. Concurrent requests for the same key coalesce onto the
//! in-flight build through a first-arrival promise (a `watch` channel);
//! the promise is cleared on completion, so a failure is only observed by
//! the calls that were waiting on it and the next request retries.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::{process::Command, sync::watch};
use tracing::{debug, info};
use walkdir::WalkDir;
use which::which;

use crate::{
    config::{ProjectConfig, ProjectKey},
    error::{BackendError, Result},
    layout::ProjectDirs,
    process::{self, CONTROL_TIMEOUT},
    thunk,
};

const MANIFEST_FILE: &str = "artifact.json";
const DIAGNOSTIC_TAIL_LINES: usize = 80;

/// Products of a successful application build. Immutable once produced
/// and shared by every stream of the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub app_bundle_path: PathBuf,
    pub executable_path: PathBuf,
    pub swift_module_paths: Vec<PathBuf>,
    pub sdk_path: PathBuf,
    pub arch: String,
    pub entry_symbols: Vec<String>,
    pub bundle_identifier: String,
    /// Swift module the thunk imports to reach the stub.
    pub module_name: String,
}

type BuildOutcome = std::result::Result<Arc<BuildArtifact>, String>;
type SlotMap = Arc<Mutex<HashMap<ProjectKey, Slot>>>;

#[derive(Debug)]
enum Slot {
    InFlight(watch::Receiver<Option<BuildOutcome>>),
    Done(Arc<BuildArtifact>),
}

/// Memoizes one artifact per project key for the backend's lifetime.
#[derive(Debug, Default)]
pub struct BuildCache {
    slots: SlotMap,
}

impl BuildCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached artifact for `key`, or run `build` to produce
    /// one. With `reuse_hint` set, a manifest left on disk by an earlier
    /// backend run short-circuits the build.
    ///
    /// # Errors
    ///
    /// `BuildFailed` with the toolchain diagnostic; never evicts a
    /// previously cached artifact.
    pub async fn build_or_reuse<F, Fut>(
        &self,
        key: &ProjectKey,
        reuse_hint: bool,
        manifest_dir: &Path,
        build: F,
    ) -> Result<Arc<BuildArtifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BuildArtifact>> + Send + 'static,
    {
        let mut rx = {
            let mut slots = self.slots.lock().expect("build cache poisoned");
            let in_flight = match slots.get(key) {
                Some(Slot::Done(artifact)) => return Ok(artifact.clone()),
                Some(Slot::InFlight(rx)) => Some(rx.clone()),
                None => None,
            };
            match in_flight {
                Some(rx) => rx,
                None => {
                    if reuse_hint {
                        if let Some(artifact) = load_manifest(manifest_dir) {
                            debug!("reusing on-disk build artifact");
                            let artifact = Arc::new(artifact);
                            slots.insert(key.clone(), Slot::Done(artifact.clone()));
                            return Ok(artifact);
                        }
                    }
                    start_build(&mut slots, &self.slots, key, build())
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BackendError::BuildFailed {
                diagnostic: "build task dropped".into(),
            })?
            .clone()
            .expect("waited for Some");

        outcome.map_err(|diagnostic| BackendError::BuildFailed { diagnostic })
    }
}

/// Insert the in-flight promise and spawn the build detached from the
/// requesting stream, so cancelling one stream does not starve the
/// others coalesced onto the same build.
fn start_build<Fut>(
    slots: &mut HashMap<ProjectKey, Slot>,
    handle: &SlotMap,
    key: &ProjectKey,
    build: Fut,
) -> watch::Receiver<Option<BuildOutcome>>
where
    Fut: Future<Output = Result<BuildArtifact>> + Send + 'static,
{
    let (tx, rx) = watch::channel(None);
    slots.insert(key.clone(), Slot::InFlight(rx.clone()));

    let key = key.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
        let outcome = match build.await {
            Ok(artifact) => Ok(Arc::new(artifact)),
            Err(err) => Err(err
                .diagnostic()
                .map_or_else(|| err.to_string(), str::to_string)),
        };
        {
            let mut slots = handle.lock().expect("build cache poisoned");
            match &outcome {
                Ok(artifact) => {
                    slots.insert(key, Slot::Done(artifact.clone()));
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        let _ = tx.send(Some(outcome));
    });

    rx
}

fn load_manifest(dir: &Path) -> Option<BuildArtifact> {
    let contents = std::fs::read(dir.join(MANIFEST_FILE)).ok()?;
    let artifact: BuildArtifact = serde_json::from_slice(&contents).ok()?;
    artifact.app_bundle_path.is_dir().then_some(artifact)
}

fn write_manifest(dir: &Path, artifact: &BuildArtifact) {
    if let Ok(contents) = serde_json::to_vec_pretty(artifact) {
        let _ = std::fs::write(dir.join(MANIFEST_FILE), contents);
    }
}

/// Build the application once with xcodebuild and assemble the artifact.
///
/// # Errors
///
/// `ToolchainMissing` when xcodebuild is absent, `BuildFailed` with the
/// tail of the toolchain output otherwise. The build itself is not
/// time-bounded; only auxiliary lookups use the control timeout.
pub async fn build_app(config: &ProjectConfig, dirs: &ProjectDirs) -> Result<BuildArtifact> {
    let xcodebuild = which("xcodebuild").map_err(|_| BackendError::ToolchainMissing {
        tool: "xcodebuild".into(),
    })?;
    dirs.ensure()?;

    let configuration = config.configuration.as_deref().unwrap_or("Debug");
    let mut command = Command::new(&xcodebuild);
    if let Some(project) = &config.project_path {
        command.arg("-project").arg(project);
    } else if let Some(workspace) = &config.workspace_path {
        command.arg("-workspace").arg(workspace);
    }
    command
        .arg("-scheme")
        .arg(&config.scheme)
        .arg("-configuration")
        .arg(configuration)
        .arg("-destination")
        .arg("generic/platform=iOS Simulator")
        .arg("-derivedDataPath")
        .arg(dirs.build())
        .arg("ARCHS=arm64")
        .arg("build")
        .kill_on_drop(true);

    info!(scheme = %config.scheme, "building application");
    let output = command.output().await?;
    if !output.status.success() {
        return Err(BackendError::BuildFailed {
            diagnostic: output_tail(&output),
        });
    }

    let products = dirs
        .build()
        .join("Build")
        .join("Products")
        .join(format!("{configuration}-iphonesimulator"));
    let app_bundle_path = find_app_bundle(&products)?;

    let info_plist = app_bundle_path.join("Info.plist");
    let executable_name = read_plist_key(&info_plist, "CFBundleExecutable").await?;
    let bundle_identifier = read_plist_key(&info_plist, "CFBundleIdentifier").await?;
    let sdk_path = simulator_sdk_path().await?;

    let artifact = BuildArtifact {
        executable_path: app_bundle_path.join(&executable_name),
        swift_module_paths: swift_module_parents(&products),
        app_bundle_path,
        sdk_path,
        arch: "arm64".into(),
        entry_symbols: vec![thunk::PREVIEW_STUB_SYMBOL.into()],
        bundle_identifier,
        module_name: module_name_for(&config.scheme),
    };
    write_manifest(dirs.build(), &artifact);
    Ok(artifact)
}

fn find_app_bundle(products: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(products).map_err(|e| BackendError::BuildFailed {
        diagnostic: format!("no products at {}: {e}", products.display()),
    })?;
    entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.extension().is_some_and(|ext| ext == "app"))
        .ok_or_else(|| BackendError::BuildFailed {
            diagnostic: format!("no .app bundle under {}", products.display()),
        })
}

/// Directories xcodebuild leaves `.swiftmodule` bundles in; passed to the
/// thunk compiler as module search paths.
fn swift_module_parents(products: &Path) -> Vec<PathBuf> {
    let mut parents: Vec<PathBuf> = WalkDir::new(products)
        .max_depth(4)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            entry.file_type().is_dir()
                && entry.path().extension().is_some_and(|ext| ext == "swiftmodule")
        })
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect();
    parents.sort();
    parents.dedup();
    parents
}

async fn read_plist_key(plist: &Path, key: &str) -> Result<String> {
    let mut command = Command::new("plutil");
    command
        .arg("-extract")
        .arg(key)
        .arg("raw")
        .arg("-o")
        .arg("-")
        .arg(plist);
    let output = process::output_with_timeout(&mut command, CONTROL_TIMEOUT).await?;
    if !output.status.success() {
        return Err(BackendError::BuildFailed {
            diagnostic: format!("{key} missing from {}", plist.display()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn simulator_sdk_path() -> Result<PathBuf> {
    let mut command = Command::new("xcrun");
    command.arg("--sdk").arg("iphonesimulator").arg("--show-sdk-path");
    let output = process::output_with_timeout(&mut command, CONTROL_TIMEOUT).await?;
    if !output.status.success() {
        return Err(BackendError::ToolchainMissing {
            tool: "iphonesimulator SDK".into(),
        });
    }
    Ok(PathBuf::from(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

fn module_name_for(scheme: &str) -> String {
    scheme
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn output_tail(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = combined.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    combined[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::{BuildArtifact, BuildCache, module_name_for, write_manifest};
    use crate::{config::ProjectConfig, error::BackendError};

    fn key(scheme: &str) -> crate::config::ProjectKey {
        ProjectConfig {
            project_path: Some(PathBuf::from("/p/App.xcodeproj")),
            workspace_path: None,
            scheme: scheme.into(),
            configuration: None,
        }
        .key()
    }

    fn artifact(dir: &std::path::Path) -> BuildArtifact {
        BuildArtifact {
            app_bundle_path: dir.to_path_buf(),
            executable_path: dir.join("App"),
            swift_module_paths: vec![],
            sdk_path: PathBuf::from("/sdk"),
            arch: "arm64".into(),
            entry_symbols: vec!["axePreviewRoot".into()],
            bundle_identifier: "com.example.App".into(),
            module_name: "App".into(),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_onto_one_build() {
        let cache = Arc::new(BuildCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let dir = std::env::temp_dir();
        let key = key("App");

        let request = |cache: Arc<BuildCache>, builds: Arc<AtomicUsize>, key: crate::config::ProjectKey| async move {
            let dir = std::env::temp_dir();
            cache
                .build_or_reuse(&key, false, &dir, move || async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(artifact(&std::env::temp_dir()))
                })
                .await
        };

        let (a, b, c) = tokio::join!(
            request(cache.clone(), builds.clone(), key.clone()),
            request(cache.clone(), builds.clone(), key.clone()),
            request(cache.clone(), builds.clone(), key.clone()),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        // A later request hits the memoized slot without building.
        let again = cache
            .build_or_reuse(&key, false, &dir, || async {
                panic!("must not rebuild a cached project")
            })
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn failure_is_not_sticky() {
        let cache = BuildCache::new();
        let dir = std::env::temp_dir();
        let key = key("Flaky");

        let first = cache
            .build_or_reuse(&key, false, &dir, || async {
                Err(BackendError::BuildFailed { diagnostic: "ld: error".into() })
            })
            .await;
        match first {
            Err(BackendError::BuildFailed { diagnostic }) => {
                assert_eq!(diagnostic, "ld: error");
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }

        let second = cache
            .build_or_reuse(&key, false, &dir, || async {
                Ok(artifact(&std::env::temp_dir()))
            })
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn reuse_hint_loads_the_on_disk_manifest() {
        let dir = std::env::temp_dir().join(format!("axe-test-manifest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        // app_bundle_path must exist for the manifest to be trusted.
        write_manifest(&dir, &artifact(&dir));

        let cache = BuildCache::new();
        let reused = cache
            .build_or_reuse(&key("Reused"), true, &dir, || async {
                panic!("reuse_hint with a manifest must skip the build")
            })
            .await
            .unwrap();
        assert_eq!(reused.app_bundle_path, dir);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn module_names_are_identifier_safe() {
        assert_eq!(module_name_for("My App-Dev"), "My_App_Dev");
        assert_eq!(module_name_for("App"), "App");
    }
}
