//! Deterministic per-project / per-device directory scheme.
//!
//! Everything the backend writes lives under a single cache root:
//!
//! ```text
//! <cache>/axe/<digest>/           project root, shared by every stream of a project
//! <cache>/axe/<digest>/build/     xcodebuild derived data, writers serialized by the cache
//! <cache>/axe/<digest>/sock       control socket (kept short; see SOCKET_PATH_MAX)
//! <cache>/axe/<digest>/devices/<udid>/{thunk,loader,staging}/
//! ```
//!
//! Two streams on the same (project, device) share a session directory;
//! the socket deliberately sits outside `devices/` so its length does not
//! grow with the udid.

use std::{fs, io, path::{Path, PathBuf}};

use crate::{
    config::ProjectKey,
    error::{BackendError, Result},
};

/// Upper bound for Unix-domain-socket paths on Darwin (`sun_path`).
pub const SOCKET_PATH_MAX: usize = 104;

const CACHE_SUBDIR: &str = "axe";

/// Per-user cache root: `~/Library/Caches` on macOS, `~/.cache` elsewhere.
#[must_use]
pub fn default_cache_root() -> PathBuf {
    let base = home::home_dir().unwrap_or_else(std::env::temp_dir);
    if cfg!(target_os = "macos") {
        base.join("Library").join("Caches")
    } else {
        base.join(".cache")
    }
}

/// Path to the isolated simulator device set.
#[must_use]
pub fn device_set_path(cache_root: &Path) -> PathBuf {
    cache_root.join(CACHE_SUBDIR).join("devices")
}

/// Shared per-project paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDirs {
    root: PathBuf,
    build: PathBuf,
    socket: PathBuf,
}

impl ProjectDirs {
    /// Derive the layout for `key` under `cache_root`.
    ///
    /// # Errors
    ///
    /// Fails with [`BackendError::ConfigInvalid`] when the derived socket
    /// path would exceed [`SOCKET_PATH_MAX`]; callers cannot recover from
    /// that without a different cache root.
    pub fn new(cache_root: &Path, key: &ProjectKey) -> Result<Self> {
        let root = cache_root.join(CACHE_SUBDIR).join(key.digest());
        let socket = root.join("sock");
        let socket_len = socket.as_os_str().len();
        if socket_len >= SOCKET_PATH_MAX {
            return Err(BackendError::ConfigInvalid(format!(
                "socket path {} is {socket_len} bytes, over the {SOCKET_PATH_MAX}-byte limit",
                socket.display()
            )));
        }
        Ok(Self {
            build: root.join("build"),
            socket,
            root,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build directory shared by all streams of the project.
    #[must_use]
    pub fn build(&self) -> &Path {
        &self.build
    }

    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Session paths for one (project, device) pair.
    #[must_use]
    pub fn session(&self, udid: &str) -> SessionDirs {
        let session = self.root.join("devices").join(udid);
        SessionDirs {
            thunk: session.join("thunk"),
            loader: session.join("loader"),
            staging: session.join("staging"),
            session,
        }
    }

    /// Create the project-level directories.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.build)
    }
}

/// Per-(project, device) paths: thunk target, loader scratch, compile
/// staging. Staging and thunk share a filesystem so the stage→current
/// rename is atomic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirs {
    session: PathBuf,
    thunk: PathBuf,
    loader: PathBuf,
    staging: PathBuf,
}

impl SessionDirs {
    #[must_use]
    pub fn session(&self) -> &Path {
        &self.session
    }

    #[must_use]
    pub fn thunk(&self) -> &Path {
        &self.thunk
    }

    #[must_use]
    pub fn loader(&self) -> &Path {
        &self.loader
    }

    #[must_use]
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// The injection target watched by the host-side loader.
    #[must_use]
    pub fn current_dylib(&self) -> PathBuf {
        self.thunk.join("current.dylib")
    }

    /// Create the session subdirectories.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [&self.thunk, &self.loader, &self.staging] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{ProjectDirs, SOCKET_PATH_MAX, device_set_path};
    use crate::config::ProjectConfig;

    fn key(container: &str, scheme: &str) -> crate::config::ProjectKey {
        ProjectConfig {
            project_path: Some(PathBuf::from(container)),
            workspace_path: None,
            scheme: scheme.into(),
            configuration: None,
        }
        .key()
    }

    #[test]
    fn same_key_and_device_share_a_session() {
        let cache = Path::new("/tmp/cache");
        let a = ProjectDirs::new(cache, &key("/p/App.xcodeproj", "App")).unwrap();
        let b = ProjectDirs::new(cache, &key("/p/App.xcodeproj", "App")).unwrap();
        assert_eq!(a.session("UDID-1").session(), b.session("UDID-1").session());
        assert_ne!(a.session("UDID-1").session(), a.session("UDID-2").session());
        assert_eq!(a.build(), b.build());
    }

    #[test]
    fn different_keys_never_collide() {
        let cache = Path::new("/tmp/cache");
        let a = ProjectDirs::new(cache, &key("/p/App.xcodeproj", "App")).unwrap();
        let b = ProjectDirs::new(cache, &key("/p/App.xcodeproj", "Widget")).unwrap();
        assert_ne!(a.root(), b.root());
        assert_ne!(a.session("U").session(), b.session("U").session());
    }

    #[test]
    fn session_subdirectories_are_disjoint() {
        let cache = Path::new("/tmp/cache");
        let dirs = ProjectDirs::new(cache, &key("/p/App.xcodeproj", "App")).unwrap();
        let session = dirs.session("UDID-1");
        for dir in [session.thunk(), session.loader(), session.staging()] {
            assert!(dir.starts_with(session.session()));
        }
        assert_ne!(session.thunk(), session.loader());
        assert_ne!(session.loader(), session.staging());
        assert_eq!(session.current_dylib(), session.thunk().join("current.dylib"));
    }

    #[test]
    fn socket_is_short_and_outside_sessions() {
        let cache = Path::new("/tmp/cache");
        let dirs = ProjectDirs::new(cache, &key("/p/App.xcodeproj", "App")).unwrap();
        assert!(dirs.socket().as_os_str().len() < SOCKET_PATH_MAX);
        assert!(!dirs.socket().starts_with(dirs.session("UDID-1").session()));
    }

    #[test]
    fn oversized_cache_root_is_rejected() {
        let long_root = PathBuf::from(format!("/{}", "x".repeat(SOCKET_PATH_MAX)));
        assert!(ProjectDirs::new(&long_root, &key("/p/App.xcodeproj", "App")).is_err());
    }

    #[test]
    fn device_set_lives_next_to_project_caches() {
        assert_eq!(
            device_set_path(Path::new("/c")),
            PathBuf::from("/c/axe/devices")
        );
    }
}
