//! Client for the companion subprocess that streams simulator video and
//! injects input.
//!
//! The companion is spawned per stream against a booted device. Its
//! stdout first carries free-form log noise, then a single JSON handshake
//! object with a non-zero `grpc_port`; that line establishes readiness.
//! After the handshake, stdout switches to length-prefixed frame records
//! (u32 big-endian length, then the encoded frame), and stdin accepts one
//! JSON input event per line.

use std::{path::{Path, PathBuf}, process::Stdio, time::Duration};

use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdout, Command},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use which::which;

use crate::{
    error::{BackendError, Result},
    process,
    protocol::InputEvent,
};

/// Default companion binary; overridable via `AXE_COMPANION`.
pub const COMPANION_BIN: &str = "idb_companion";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// Reject absurd frame lengths so a corrupt record cannot trigger a huge
/// allocation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Locate the companion binary.
///
/// # Errors
///
/// `ToolchainMissing` when neither `AXE_COMPANION` nor `PATH` yields one.
pub fn find_companion() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("AXE_COMPANION") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }
    which(COMPANION_BIN).map_err(|_| BackendError::ToolchainMissing {
        tool: COMPANION_BIN.into(),
    })
}

#[derive(Debug, Deserialize)]
struct Handshake {
    #[serde(default)]
    grpc_port: u32,
}

/// A connected frame transport.
#[derive(Debug)]
pub struct FrameTransport {
    frames: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<InputEvent>,
    stop: CancellationToken,
    exit: watch::Receiver<Option<String>>,
    grpc_port: u32,
}

impl FrameTransport {
    /// Spawn the companion for `udid` and complete the startup handshake.
    ///
    /// # Errors
    ///
    /// `CompanionNotReady` when the handshake does not yield a usable
    /// port within the timeout or stdout closes first.
    pub async fn connect(companion: &Path, udid: &str, device_set: &Path) -> Result<Self> {
        let mut child = Command::new(companion)
            .arg("--udid")
            .arg(udid)
            .arg("--device-set-path")
            .arg(device_set)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::CompanionNotReady(format!("failed to spawn: {e}")))?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stdin = child.stdin.take().expect("stdin is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        tokio::spawn(async {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(%line, "companion stderr");
            }
        });

        let mut reader = BufReader::new(stdout);

        // The readiness bound is time-to-first-byte; a companion that is
        // talking gets as long as it needs to reach the handshake line.
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.fill_buf()).await {
            Ok(Ok(buf)) if !buf.is_empty() => {}
            Ok(_) => {
                process::terminate(&mut child).await;
                return Err(BackendError::CompanionNotReady(
                    "stdout closed before any output".into(),
                ));
            }
            Err(_) => {
                process::terminate(&mut child).await;
                return Err(BackendError::CompanionNotReady(format!(
                    "no output within {HANDSHAKE_TIMEOUT:?}"
                )));
            }
        }
        let grpc_port = match read_handshake(&mut reader).await {
            Ok(port) => port,
            Err(err) => {
                process::terminate(&mut child).await;
                return Err(err);
            }
        };
        debug!(udid, grpc_port, "companion ready");

        let (frames_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (input_tx, mut input_rx) = mpsc::channel::<InputEvent>(FRAME_CHANNEL_CAPACITY);
        let (exit_tx, exit) = watch::channel(None);
        let stop = CancellationToken::new();

        // Frame reader: forwards complete records until EOF.
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("frame stream error: {err}");
                        break;
                    }
                }
            }
        });

        // Input writer: one JSON event per line on companion stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(event) = input_rx.recv().await {
                let Ok(mut line) = serde_json::to_vec(&event) else {
                    continue;
                };
                line.push(b'\n');
                if stdin.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        // Monitor: owns the child, reports the exit description.
        let monitor_stop = stop.clone();
        tokio::spawn(async move {
            let detail = tokio::select! {
                () = monitor_stop.cancelled() => process::terminate(&mut child).await,
                status = child.wait() => match status {
                    Ok(status) => process::exit_status_string(status),
                    Err(err) => err.to_string(),
                },
            };
            let _ = exit_tx.send(Some(detail));
        });

        Ok(Self { frames, input_tx, stop, exit, grpc_port })
    }

    /// Port reported in the handshake (unused by the core; logged for
    /// front-end diagnostics).
    #[must_use]
    pub const fn grpc_port(&self) -> u32 {
        self.grpc_port
    }

    /// Next complete frame, or `None` once the companion is gone.
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.recv().await
    }

    /// Forward an input event. A momentarily full queue drops the event;
    /// input is best-effort.
    ///
    /// # Errors
    ///
    /// `TransportClosed` when the companion has exited.
    pub fn send_input(&self, event: InputEvent) -> Result<()> {
        match self.input_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("input queue full, dropping event");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(BackendError::TransportClosed(self.exit_description()))
            }
        }
    }

    /// Exit description once the companion has exited.
    #[must_use]
    pub fn exit_description(&self) -> String {
        self.exit
            .borrow()
            .clone()
            .unwrap_or_else(|| "companion exited".to_string())
    }

    /// Wait for the monitor to record the exit status. Used when the
    /// frame stream ends, which can race the child reaper by a moment.
    pub async fn wait_exit(&mut self) -> String {
        match self.exit.wait_for(Option::is_some).await {
            Ok(detail) => detail.clone().unwrap_or_default(),
            Err(_) => "companion exited".to_string(),
        }
    }

    /// Terminate the companion (SIGTERM, SIGKILL after the grace period)
    /// and wait for it to exit. Idempotent: closing an already-dead
    /// transport just observes the recorded exit.
    pub async fn close(mut self) {
        self.stop.cancel();
        let _ = self.exit.wait_for(Option::is_some).await;
    }
}

/// Scan stdout for the handshake line. Non-JSON noise is logged and
/// ignored; JSON without a usable port keeps scanning.
async fn read_handshake(reader: &mut BufReader<ChildStdout>) -> Result<u32> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(BackendError::CompanionNotReady(
                "stdout closed before the handshake".into(),
            ));
        }
        let trimmed = line.trim();
        match serde_json::from_str::<Handshake>(trimmed) {
            Ok(Handshake { grpc_port }) if grpc_port != 0 => return Ok(grpc_port),
            Ok(_) => debug!(line = trimmed, "handshake candidate without a port"),
            Err(_) => debug!(line = trimmed, "companion noise before handshake"),
        }
    }
}

/// Read one length-prefixed frame record; `None` at EOF.
async fn read_frame(reader: &mut BufReader<ChildStdout>) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(header);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(std::io::Error::other(format!("bad frame length {len}")));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}
