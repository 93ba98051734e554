//! Xcode-free SwiftUI live previews.
//!
//! axe builds the enclosing application once, extracts the chosen
//! preview's view expression, compiles it into a small dynamic library
//! that dynamically replaces a stub in the host app, launches the app on
//! a headless simulator, and streams the rendered screen to an editor
//! front-end. Edits recompile only the preview thunk.
//!
//! The crate's core is the serve backend ([`serve`]): a long-running
//! process multiplexing many preview streams over a line-delimited JSON
//! protocol on stdin/stdout. See [`protocol`] for the wire format and
//! [`stream`] for the per-preview state machine.

pub mod analyzer;
pub mod build;
pub mod config;
pub mod error;
pub mod layout;
pub mod process;
pub mod protocol;
pub mod serve;
pub mod simulator;
pub mod stream;
pub mod thunk;
pub mod transport;
pub mod watcher;
