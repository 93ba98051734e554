//! Error kinds carried on protocol events and internal results.
//!
//! Every failure the backend can surface to a front-end maps onto one of
//! these variants. `reason()` yields the wire string used in
//! `StreamStopped.reason`, and `is_stream_terminal()` implements the
//! terminal/non-terminal classification: terminal errors emit
//! `StreamStopped` and tear the stream down, non-terminal errors emit
//! `StreamStatus` and leave the stream live.

use std::io;

use thiserror::Error;

/// Result alias used throughout the backend.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors produced by the preview serve backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Project configuration is unusable (both or neither of
    /// project/workspace set, missing scheme). Fatal at stream creation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A required external binary is absent from the environment.
    #[error("required tool not found: {tool}")]
    ToolchainMissing {
        /// Name of the missing binary.
        tool: String,
    },

    /// An explicitly requested device is not present in the isolated set.
    #[error("device not found in the isolated device set: {0}")]
    DeviceNotFound(String),

    /// The companion handshake failed or its stdout closed without a port.
    #[error("companion did not become ready: {0}")]
    CompanionNotReady(String),

    /// Headless boot never reported the `Booted` state.
    #[error("simulator failed to boot: {0}")]
    BootFailed(String),

    /// The initial application build failed.
    #[error("application build failed")]
    BuildFailed {
        /// Toolchain output explaining the failure.
        diagnostic: String,
    },

    /// The preview thunk failed to compile. Non-terminal while the stream
    /// is running; the previously injected dylib stays live.
    #[error("thunk compile failed")]
    CompileError {
        /// Compiler stderr.
        diagnostic: String,
    },

    /// No preview with the requested title exists in the source file.
    #[error("no preview titled {0:?}")]
    SelectorNotFound(String),

    /// The requested preview index exceeds the number of previews.
    #[error("preview index {index} out of range ({count} previews)")]
    SelectorOutOfRange {
        /// Requested zero-based index.
        index: usize,
        /// Number of previews found in the file.
        count: usize,
    },

    /// The source file contains no preview declarations.
    #[error("no preview declarations found")]
    NoPreviewFound,

    /// The frame transport subprocess is gone.
    #[error("frame transport closed: {0}")]
    TransportClosed(String),

    /// A command or frame violated the line protocol. Never terminates a
    /// stream by itself.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An in-flight operation was cancelled by a newer request or by
    /// stream teardown. Never surfaced on the wire.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    /// Wire reason string for `StreamStopped` / diagnostics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::ToolchainMissing { .. } => "ToolchainMissing",
            Self::DeviceNotFound(_) => "DeviceNotFound",
            Self::CompanionNotReady(_) => "CompanionNotReady",
            Self::BootFailed(_) => "BootFailed",
            Self::BuildFailed { .. } => "BuildFailed",
            Self::CompileError { .. } => "CompileError",
            Self::SelectorNotFound(_) => "SelectorNotFound",
            Self::SelectorOutOfRange { .. } => "SelectorOutOfRange",
            Self::NoPreviewFound => "NoPreviewFound",
            Self::TransportClosed(_) => "TransportClosed",
            Self::Protocol(_) => "ProtocolError",
            Self::Cancelled => "Cancelled",
            Self::Io(_) => "Io",
        }
    }

    /// Extra payload attached to events, when the variant carries one.
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { diagnostic } | Self::CompileError { diagnostic } => {
                Some(diagnostic)
            }
            Self::TransportClosed(detail)
            | Self::BootFailed(detail)
            | Self::CompanionNotReady(detail) => Some(detail),
            _ => None,
        }
    }

    /// Whether this error ends the stream that produced it.
    ///
    /// Selector errors are terminal only at stream creation; when raised by
    /// a `NextPreview` command the stream stays running, which the stream
    /// loop handles before classification reaches this point.
    #[must_use]
    pub const fn is_stream_terminal(&self) -> bool {
        !matches!(
            self,
            Self::CompileError { .. } | Self::Protocol(_) | Self::Cancelled
        )
    }

    /// True for selector-resolution failures, which are downgraded to
    /// non-terminal when triggered by `NextPreview`.
    #[must_use]
    pub const fn is_selector_error(&self) -> bool {
        matches!(
            self,
            Self::SelectorNotFound(_) | Self::SelectorOutOfRange { .. } | Self::NoPreviewFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::BackendError;

    #[test]
    fn compile_errors_are_not_terminal() {
        let err = BackendError::CompileError {
            diagnostic: "type mismatch".into(),
        };
        assert!(!err.is_stream_terminal());
        assert_eq!(err.reason(), "CompileError");
        assert_eq!(err.diagnostic(), Some("type mismatch"));
    }

    #[test]
    fn transport_loss_is_terminal_with_diagnostic() {
        let err = BackendError::TransportClosed("signal: killed".into());
        assert!(err.is_stream_terminal());
        assert_eq!(err.diagnostic(), Some("signal: killed"));
    }

    #[test]
    fn selector_errors_are_classified() {
        assert!(BackendError::NoPreviewFound.is_selector_error());
        assert!(
            BackendError::SelectorOutOfRange { index: 9, count: 2 }.is_selector_error()
        );
        assert!(!BackendError::Cancelled.is_selector_error());
    }
}
