//! Per-preview stream: build → boot → launch → stream → rebuild on change.
//!
//! Each stream runs as one supervisor task plus short-lived rebuild
//! tasks. The supervisor owns the transport and the watch subscription;
//! rebuilds run detached with a child cancellation token so a newer
//! trigger (or stream teardown) cancels the in-flight compile without
//! stalling frame delivery.

use std::{path::{Path, PathBuf}, sync::Arc, time::Duration};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    analyzer::{self, SelectedPreview},
    build::{self, BuildCache},
    config::ProjectConfig,
    error::{BackendError, Result},
    layout::ProjectDirs,
    protocol::{
        DeviceInfo, DeviceSelection, Event, FramePayload, InputEvent, Selector, StatusPhase,
    },
    serve::EventSink,
    simulator::{self, DeviceRegistry, ResolvedDevice, Simctl},
    thunk::ThunkCompiler,
    transport::FrameTransport,
    watcher::WatcherHub,
};

/// Trailing-edge debounce for file-change rebuilds: events within the
/// window coalesce into one rebuild at its end.
pub const REBUILD_DEBOUNCE: Duration = Duration::from_millis(150);

/// Everything a stream needs to start.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub stream_id: String,
    pub file: PathBuf,
    pub selector: Option<Selector>,
    pub device: DeviceSelection,
    pub project: ProjectConfig,
}

/// Services shared by every stream of the backend.
#[derive(Debug, Clone)]
pub struct SharedServices {
    pub cache: Arc<BuildCache>,
    pub simctl: Arc<Simctl>,
    pub devices: Arc<DeviceRegistry>,
    pub watchers: Arc<WatcherHub>,
    pub companion: PathBuf,
    pub cache_root: PathBuf,
    pub events: EventSink,
}

/// Commands routed to a running stream.
#[derive(Debug)]
enum StreamControl {
    NextPreview,
    ChangeDevice(DeviceSelection),
}

/// The multiplexer's handle to one stream.
#[derive(Debug)]
pub struct StreamHandle {
    id: String,
    input_tx: mpsc::Sender<InputEvent>,
    control_tx: mpsc::Sender<StreamControl>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Forward an input event; returns false when the stream is gone or
    /// saturated.
    pub fn send_input(&self, event: InputEvent) -> bool {
        self.input_tx.try_send(event).is_ok()
    }

    pub fn next_preview(&self) -> bool {
        self.control_tx.try_send(StreamControl::NextPreview).is_ok()
    }

    pub fn change_device(&self, selection: DeviceSelection) -> bool {
        self.control_tx
            .try_send(StreamControl::ChangeDevice(selection))
            .is_ok()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the stream and wait for its `StreamStopped` to be emitted.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn a stream supervisor. The handle's `stop` is the only way to end
/// it from outside; everything else ends it from inside.
#[must_use]
pub fn spawn(spec: StreamSpec, services: SharedServices) -> StreamHandle {
    let cancel = CancellationToken::new();
    let (input_tx, input_rx) = mpsc::channel(32);
    let (control_tx, control_rx) = mpsc::channel(8);
    let id = spec.stream_id.clone();
    let task = tokio::spawn(supervise(spec, services, cancel.clone(), input_rx, control_rx));
    StreamHandle { id, input_tx, control_tx, cancel, task }
}

async fn supervise(
    spec: StreamSpec,
    services: SharedServices,
    cancel: CancellationToken,
    input_rx: mpsc::Receiver<InputEvent>,
    control_rx: mpsc::Receiver<StreamControl>,
) {
    let stream_id = spec.stream_id.clone();
    let events = services.events.clone();
    match run(spec, &services, &cancel, input_rx, control_rx).await {
        Ok(()) | Err(BackendError::Cancelled) => {
            info!(stream_id = %stream_id, "stream stopped");
            events.emit(Event::StreamStopped {
                stream_id,
                reason: "Stopped".into(),
                message: "stream stopped".into(),
                diagnostic: None,
            });
        }
        Err(err) => {
            warn!(stream_id = %stream_id, %err, "stream failed");
            events.emit(Event::StreamStopped {
                stream_id,
                reason: err.reason().into(),
                message: err.to_string(),
                diagnostic: err.diagnostic().map(str::to_string),
            });
        }
    }
}

/// How a device session ended, short of a terminal error.
enum SessionExit {
    Cancelled,
    SwitchDevice(DeviceSelection),
}

#[allow(clippy::too_many_lines)]
async fn run(
    spec: StreamSpec,
    services: &SharedServices,
    cancel: &CancellationToken,
    mut input_rx: mpsc::Receiver<InputEvent>,
    mut control_rx: mpsc::Receiver<StreamControl>,
) -> Result<()> {
    let events = &services.events;
    spec.project.validate()?;

    // Building: one application build per project, shared across streams.
    events.status(&spec.stream_id, StatusPhase::Building, None);
    let key = spec.project.key();
    let dirs = ProjectDirs::new(&services.cache_root, &key)?;
    let artifact = {
        let config = spec.project.clone();
        let build_dirs = dirs.clone();
        let build = services.cache.build_or_reuse(&key, true, dirs.build(), move || async move {
            build::build_app(&config, &build_dirs).await
        });
        // The build itself is shared and keeps running; only this stream's
        // wait is cancellable.
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = build => result?,
        }
    };

    let mut selection = spec.device.clone();
    let mut selector = spec.selector.clone();
    let mut started = false;

    loop {
        // Booting: resolve against the isolated set, boot headlessly.
        events.status(&spec.stream_id, StatusPhase::Booting, None);
        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = services.simctl.resolve(&selection) => result?,
        };
        // Once acquired, the device is always released below, so the boot
        // wait itself is not cancellable.
        let mut device_done = services.devices.acquire(&resolved.udid).await?;

        let exit = run_session(
            &spec,
            services,
            cancel,
            &artifact,
            &dirs,
            &resolved,
            &mut device_done,
            &mut input_rx,
            &mut control_rx,
            &mut selector,
            &mut started,
        )
        .await;

        // The device shuts down only when no other stream holds it.
        services.devices.release(&resolved.udid).await;

        match exit? {
            SessionExit::Cancelled => return Ok(()),
            SessionExit::SwitchDevice(next) => {
                debug!(stream_id = %spec.stream_id, "switching device");
                selection = next;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    spec: &StreamSpec,
    services: &SharedServices,
    cancel: &CancellationToken,
    artifact: &Arc<build::BuildArtifact>,
    dirs: &ProjectDirs,
    resolved: &ResolvedDevice,
    device_done: &mut watch::Receiver<Option<String>>,
    input_rx: &mut mpsc::Receiver<InputEvent>,
    control_rx: &mut mpsc::Receiver<StreamControl>,
    selector: &mut Option<Selector>,
    started: &mut bool,
) -> Result<SessionExit> {
    let events = &services.events;

    // Launching: compile the initial thunk, then launch the host app with
    // the injection environment pointing at the session's thunk dir.
    events.status(&spec.stream_id, StatusPhase::Launching, None);
    let session = dirs.session(&resolved.udid);
    session.ensure()?;
    let compiler = Arc::new(ThunkCompiler::new(artifact.clone(), session.clone()));

    let source = tokio::fs::read_to_string(&spec.file).await?;
    let mut current = analyzer::select_preview(&source, selector.as_ref())?;
    compiler.compile_and_stage(&current.body_text, cancel).await?;

    services
        .simctl
        .install_app(&resolved.udid, &artifact.app_bundle_path)
        .await?;
    services
        .simctl
        .launch_app(&resolved.udid, &artifact.bundle_identifier, session.thunk())
        .await?;

    // Running: attach the transport and the watch subscription.
    let mut transport = FrameTransport::connect(
        &services.companion,
        &resolved.udid,
        services.simctl.device_set(),
    )
    .await?;
    let mut watch_sub = services
        .watchers
        .subscribe(&spec.project.source_root())
        .map_err(|e| BackendError::Io(std::io::Error::other(e.to_string())))?;

    if !*started {
        *started = true;
        events.emit(Event::StreamStarted {
            stream_id: spec.stream_id.clone(),
            device: DeviceInfo { udid: resolved.udid.clone(), name: resolved.name.clone() },
            preview_title: current.resolved_title.clone(),
        });
    } else {
        events.status(&spec.stream_id, StatusPhase::Running, None);
    }

    let mut rebuild: Option<RebuildInFlight> = None;
    let mut debounce_deadline: Option<Instant> = None;

    let exit = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                break Ok(SessionExit::Cancelled);
            }

            // Involuntary simulator termination.
            detail = simulator::wait_done(device_done) => {
                break Err(BackendError::BootFailed(format!(
                    "simulator exited ({detail})"
                )));
            }

            frame = transport.next_frame() => {
                match frame {
                    Some(bytes) => events.emit(Event::Frame {
                        stream_id: spec.stream_id.clone(),
                        frame: FramePayload { data: BASE64.encode(bytes) },
                    }),
                    None => break Err(BackendError::TransportClosed(
                        transport.wait_exit().await,
                    )),
                }
            }

            Some(event) = input_rx.recv() => {
                if let Err(err) = transport.send_input(event) {
                    warn!(stream_id = %spec.stream_id, %err, "dropping input event");
                }
            }

            Some(control) = control_rx.recv() => {
                match control {
                    StreamControl::ChangeDevice(next) => {
                        cancel_rebuild(&mut rebuild);
                        break Ok(SessionExit::SwitchDevice(next));
                    }
                    StreamControl::NextPreview => {
                        let next = Selector::Index(analyzer::next_preview(
                            current.index,
                            current.count,
                        ));
                        *selector = Some(next);
                        start_rebuild(
                            spec, services, cancel, &compiler, selector.clone(),
                            RebuildCause::NextPreview, &mut rebuild,
                        );
                    }
                }
            }

            Some(path) = watch_sub.recv() => {
                if same_source_file(&path, &spec.file) && debounce_deadline.is_none() {
                    debounce_deadline = Some(Instant::now() + REBUILD_DEBOUNCE);
                }
            }

            () = async { tokio::time::sleep_until(debounce_deadline.unwrap()).await },
                if debounce_deadline.is_some() =>
            {
                debounce_deadline = None;
                start_rebuild(
                    spec, services, cancel, &compiler, selector.clone(),
                    RebuildCause::FileChange, &mut rebuild,
                );
            }

            result = async { rebuild.as_mut().unwrap().handle.as_mut().await },
                if rebuild.is_some() =>
            {
                let finished = rebuild.take().expect("rebuild was in flight");
                match flatten_rebuild(result) {
                    Ok(preview) => {
                        current = preview;
                        events.status(&spec.stream_id, StatusPhase::Running, None);
                    }
                    Err(BackendError::Cancelled) => {}
                    Err(err)
                        if !err.is_stream_terminal()
                            || (finished.cause == RebuildCause::NextPreview
                                && err.is_selector_error()) =>
                    {
                        // Stream stays live on the previous dylib.
                        events.status(
                            &spec.stream_id,
                            StatusPhase::CompileError,
                            Some(err.diagnostic().map_or_else(|| err.to_string(), str::to_string)),
                        );
                    }
                    Err(err) => break Err(err),
                }
            }
        }
    };

    cancel_rebuild(&mut rebuild);
    transport.close().await;
    drop(watch_sub);
    exit
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RebuildCause {
    FileChange,
    NextPreview,
}

struct RebuildInFlight {
    handle: std::pin::Pin<Box<JoinHandle<Result<SelectedPreview>>>>,
    cancel: CancellationToken,
    cause: RebuildCause,
}

/// Start a rebuild, cancelling any in-flight one: the newest trigger
/// always wins.
fn start_rebuild(
    spec: &StreamSpec,
    services: &SharedServices,
    stream_cancel: &CancellationToken,
    compiler: &Arc<ThunkCompiler>,
    selector: Option<Selector>,
    cause: RebuildCause,
    rebuild: &mut Option<RebuildInFlight>,
) {
    cancel_rebuild(rebuild);
    services
        .events
        .status(&spec.stream_id, StatusPhase::Rebuilding, None);

    let file = spec.file.clone();
    let compiler = compiler.clone();
    let cancel = stream_cancel.child_token();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let source = tokio::fs::read_to_string(&file).await?;
        let preview = analyzer::select_preview(&source, selector.as_ref())?;
        compiler.compile_and_stage(&preview.body_text, &task_cancel).await?;
        Ok(preview)
    });

    *rebuild = Some(RebuildInFlight { handle: Box::pin(handle), cancel, cause });
}

fn cancel_rebuild(rebuild: &mut Option<RebuildInFlight>) {
    if let Some(in_flight) = rebuild.take() {
        in_flight.cancel.cancel();
        // The task observes the token, kills the compiler and removes its
        // partial staging file on its own; no need to await it.
    }
}

fn flatten_rebuild(
    result: std::result::Result<Result<SelectedPreview>, tokio::task::JoinError>,
) -> Result<SelectedPreview> {
    match result {
        Ok(inner) => inner,
        Err(join_error) if join_error.is_cancelled() => Err(BackendError::Cancelled),
        Err(join_error) => Err(BackendError::Io(std::io::Error::other(format!(
            "rebuild task panicked: {join_error}"
        )))),
    }
}

/// Watch events carry whatever path the OS reports; match against the
/// stream's file by identity when possible, by path equality otherwise.
fn same_source_file(reported: &Path, configured: &Path) -> bool {
    if reported == configured {
        return true;
    }
    match (reported.canonicalize(), configured.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{REBUILD_DEBOUNCE, same_source_file};

    #[test]
    fn debounce_window_matches_the_design() {
        assert_eq!(REBUILD_DEBOUNCE.as_millis(), 150);
    }

    #[test]
    fn distinct_paths_do_not_match() {
        assert!(same_source_file(Path::new("/p/V.swift"), Path::new("/p/V.swift")));
        assert!(!same_source_file(Path::new("/p/A.swift"), Path::new("/p/B.swift")));
    }
}
