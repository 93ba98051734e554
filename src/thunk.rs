//! Thunk generation and the compile → stage → atomic-swap pipeline.
//!
//! The host application exports a dynamic stub returning its preview
//! root view. Each rebuild generates a small Swift source that declares a
//! dynamic replacement for that stub around the selected preview body,
//! compiles it into a dylib in the staging directory, and renames it onto
//! `thunk/current.dylib`. Staging and thunk live on the same filesystem,
//! so the host-side loader only ever observes a complete file.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    build::BuildArtifact,
    error::{BackendError, Result},
    layout::SessionDirs,
};

/// Stub symbol the host application declares `dynamic` and the thunk
/// replaces.
pub const PREVIEW_STUB_SYMBOL: &str = "axePreviewRoot";

/// Deployment target for thunk compiles; kept low so the dylib loads on
/// every runtime the device set can contain.
const MIN_IOS_VERSION: &str = "15.0";

/// Compiles preview bodies into the injected dylib for one session.
#[derive(Debug)]
pub struct ThunkCompiler {
    artifact: Arc<BuildArtifact>,
    dirs: SessionDirs,
    sequence: AtomicU64,
}

impl ThunkCompiler {
    #[must_use]
    pub fn new(artifact: Arc<BuildArtifact>, dirs: SessionDirs) -> Self {
        Self { artifact, dirs, sequence: AtomicU64::new(0) }
    }

    /// Compile `body_text` and atomically publish the result as
    /// `current.dylib`. Exactly one publication per successful call.
    ///
    /// # Errors
    ///
    /// `CompileError` with swiftc's stderr (the previous dylib stays
    /// live), or `Cancelled` when the token fires mid-compile; in both
    /// cases the partial staging file is removed and `current.dylib` is
    /// untouched.
    pub async fn compile_and_stage(
        &self,
        body_text: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let source_path = self.dirs.staging().join(format!("thunk-{n}.swift"));
        let dylib_path = self.dirs.staging().join(format!("thunk-{n}.dylib"));
        let source = generate_thunk_source(&self.artifact.module_name, body_text);
        std::fs::write(&source_path, source)?;

        let mut command = Command::new("xcrun");
        command
            .arg("swiftc")
            .arg("-target")
            .arg(format!("{}-apple-ios{MIN_IOS_VERSION}-simulator", self.artifact.arch))
            .arg("-sdk")
            .arg(&self.artifact.sdk_path)
            .arg("-emit-library")
            .arg("-parse-as-library")
            .arg("-module-name")
            .arg("AxePreviewThunk")
            .arg("-o")
            .arg(&dylib_path);
        for module_path in &self.artifact.swift_module_paths {
            command.arg("-I").arg(module_path);
        }
        command
            .arg("-Xlinker")
            .arg("-undefined")
            .arg("-Xlinker")
            .arg("dynamic_lookup")
            .arg(&source_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(thunk = %dylib_path.display(), "compiling preview thunk");
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = std::fs::remove_file(&dylib_path);
                let _ = std::fs::remove_file(&source_path);
                return Err(BackendError::Cancelled);
            }
            output = command.output() => output?,
        };
        let _ = std::fs::remove_file(&source_path);

        if !output.status.success() {
            let _ = std::fs::remove_file(&dylib_path);
            return Err(BackendError::CompileError {
                diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Single rename on one filesystem; the loader never sees a
        // partial file.
        let current = self.dirs.current_dylib();
        std::fs::rename(&dylib_path, &current)?;
        info!(current = %current.display(), "published preview thunk");
        Ok(current)
    }
}

/// The generated replacement source around a preview body.
#[must_use]
pub fn generate_thunk_source(module_name: &str, body_text: &str) -> String {
    let body = indent(body_text, "        ");
    format!(
        r#"import SwiftUI
import {module_name}

@_dynamicReplacement(for: {PREVIEW_STUB_SYMBOL}())
public func __axePreviewThunk() -> AnyView {{
    AnyView(
{body}
    )
}}
"#
    )
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc, sync::atomic::Ordering};

    use super::{PREVIEW_STUB_SYMBOL, ThunkCompiler, generate_thunk_source};
    use crate::{build::BuildArtifact, config::ProjectConfig, layout::ProjectDirs};

    #[test]
    fn thunk_source_replaces_the_stub_and_imports_the_module() {
        let source = generate_thunk_source("MyApp", "ContentView()\n    .padding()");
        assert!(source.contains("import MyApp"));
        assert!(source.contains(&format!("@_dynamicReplacement(for: {PREVIEW_STUB_SYMBOL}())")));
        assert!(source.contains("        ContentView()"));
        assert!(source.contains("            .padding()"));
        assert!(source.ends_with("}\n"));
    }

    #[test]
    fn staging_names_are_sequential() {
        let config = ProjectConfig {
            project_path: Some(PathBuf::from("/p/App.xcodeproj")),
            workspace_path: None,
            scheme: "App".into(),
            configuration: None,
        };
        let dirs = ProjectDirs::new(std::path::Path::new("/tmp/cache"), &config.key()).unwrap();
        let artifact = BuildArtifact {
            app_bundle_path: PathBuf::from("/tmp/App.app"),
            executable_path: PathBuf::from("/tmp/App.app/App"),
            swift_module_paths: vec![],
            sdk_path: PathBuf::from("/sdk"),
            arch: "arm64".into(),
            entry_symbols: vec![PREVIEW_STUB_SYMBOL.into()],
            bundle_identifier: "com.example.App".into(),
            module_name: "App".into(),
        };
        let compiler = ThunkCompiler::new(Arc::new(artifact), dirs.session("UDID"));
        assert_eq!(compiler.sequence.fetch_add(1, Ordering::Relaxed), 0);
        assert_eq!(compiler.sequence.fetch_add(1, Ordering::Relaxed), 1);
    }
}
