//! The serve multiplexer: commands in on stdin, events out on stdout.
//!
//! One reader task parses command lines and dispatches synchronously to
//! the router; each stream runs on its own tasks. One writer task drains
//! the event queue, so output bytes never interleave. EOF on stdin shuts
//! every stream down in parallel and exits cleanly.
//!
//! Backpressure is latest-frame-wins: when a stream has more than
//! [`FRAME_QUEUE_QUOTA`] frames queued, the oldest queued frame of that
//! stream is dropped. Lifecycle events are never dropped.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures_util::StreamExt;
use tokio::{io::AsyncWriteExt, sync::Notify};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info};

use crate::{
    build::BuildCache,
    config::ConfigDefaults,
    error::Result,
    layout,
    protocol::{
        self, Command, DeviceSelection, Event, MAX_LINE_BYTES, Selector, StatusPhase,
    },
    simulator::{DeviceRegistry, Simctl},
    stream::{self, SharedServices, StreamHandle, StreamSpec},
    transport,
};

/// Queued frames per stream before the oldest is dropped.
const FRAME_QUEUE_QUOTA: usize = 2;

/// Serialized handle to the stdout event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    shared: Arc<SinkShared>,
}

#[derive(Debug)]
struct SinkShared {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
}

impl EventSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SinkShared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an event for the writer. Frames beyond the per-stream
    /// quota displace the oldest queued frame of the same stream.
    pub fn emit(&self, event: Event) {
        {
            let mut queue = self.shared.queue.lock().expect("event queue poisoned");
            if event.is_frame() {
                let stream_id = event.stream_id().map(str::to_string);
                let queued = queue
                    .iter()
                    .filter(|e| e.is_frame() && e.stream_id() == stream_id.as_deref())
                    .count();
                if queued >= FRAME_QUEUE_QUOTA {
                    if let Some(oldest) = queue
                        .iter()
                        .position(|e| e.is_frame() && e.stream_id() == stream_id.as_deref())
                    {
                        queue.remove(oldest);
                    }
                }
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }

    /// Convenience for phase transitions.
    pub fn status(&self, stream_id: &str, phase: StatusPhase, diagnostic: Option<String>) {
        self.emit(Event::StreamStatus {
            stream_id: stream_id.to_string(),
            phase,
            diagnostic,
        });
    }

    fn take_batch(&self) -> Vec<Event> {
        let mut queue = self.shared.queue.lock().expect("event queue poisoned");
        queue.drain(..).collect()
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the queue to stdout until the sink is closed and empty.
async fn write_events(sink: EventSink) {
    let mut stdout = tokio::io::stdout();
    loop {
        let batch = sink.take_batch();
        if batch.is_empty() {
            if sink.is_closed() {
                break;
            }
            sink.shared.notify.notified().await;
            continue;
        }
        for event in &batch {
            let mut line = protocol::encode_event(event).into_bytes();
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() {
                // Front-end went away; there is nobody left to tell.
                return;
            }
        }
        let _ = stdout.flush().await;
    }
    let _ = stdout.flush().await;
}

/// Run the backend until stdin closes.
///
/// # Errors
///
/// Only unrecoverable initialization failures: missing companion binary
/// or an uncreatable device set. Everything later is reported as events.
pub async fn serve(defaults: ConfigDefaults) -> Result<()> {
    let companion = transport::find_companion()?;
    let cache_root = layout::default_cache_root();
    let simctl = Arc::new(Simctl::new(layout::device_set_path(&cache_root))?);

    let sink = EventSink::new();
    let services = SharedServices {
        cache: Arc::new(BuildCache::new()),
        devices: Arc::new(DeviceRegistry::new(simctl.clone(), companion.clone())),
        simctl,
        watchers: Arc::new(crate::watcher::WatcherHub::new()),
        companion,
        cache_root,
        events: sink.clone(),
    };
    let writer = tokio::spawn(write_events(sink.clone()));

    let mut router = Router { streams: HashMap::new(), services, defaults };
    let mut lines = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => router.dispatch_line(&line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                sink.emit(Event::ProtocolError {
                    request_id: None,
                    message: format!("line exceeds the {MAX_LINE_BYTES}-byte limit"),
                });
            }
            Err(LinesCodecError::Io(err)) => {
                error!(%err, "stdin read failed");
                break;
            }
        }
    }

    info!("stdin closed, stopping all streams");
    router.stop_all().await;
    sink.close();
    let _ = writer.await;
    Ok(())
}

struct Router {
    streams: HashMap<String, StreamHandle>,
    services: SharedServices,
    defaults: ConfigDefaults,
}

impl Router {
    async fn dispatch_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match protocol::parse_command(line) {
            Ok(command) => self.dispatch(command).await,
            Err(err) => self.services.events.emit(Event::ProtocolError {
                request_id: protocol::salvage_request_id(line),
                message: err.to_string(),
            }),
        }
    }

    async fn dispatch(&mut self, command: Command) {
        debug!(stream_id = %command.stream_id(), "dispatching command");
        match command {
            Command::AddStream { request_id, stream_id, file, device, selector } => {
                self.add_stream(&request_id, stream_id, file, device, selector);
            }
            Command::ReplaceAllStreams { request_id, stream_id, file, device, selector } => {
                self.stop_all().await;
                self.add_stream(&request_id, stream_id, file, device, selector);
            }
            Command::RemoveStream { request_id, stream_id } => {
                match self.streams.remove(&stream_id) {
                    Some(handle) => handle.stop().await,
                    None => self.unknown_stream(Some(request_id), &stream_id),
                }
            }
            Command::SendInput { stream_id, event } => match self.streams.get(&stream_id) {
                Some(handle) => {
                    if !handle.send_input(event) {
                        debug!(stream_id = %stream_id, "input dropped, stream busy or gone");
                    }
                }
                None => self.unknown_stream(None, &stream_id),
            },
            Command::NextPreview { stream_id } => match self.streams.get(&stream_id) {
                Some(handle) => {
                    handle.next_preview();
                }
                None => self.unknown_stream(None, &stream_id),
            },
            Command::ChangeDevice { request_id, stream_id, device } => {
                match self.streams.get(&stream_id) {
                    Some(handle) => {
                        handle.change_device(device);
                    }
                    None => self.unknown_stream(Some(request_id), &stream_id),
                }
            }
        }
    }

    fn add_stream(
        &mut self,
        request_id: &str,
        stream_id: String,
        file: PathBuf,
        mut device: DeviceSelection,
        selector: Option<Selector>,
    ) {
        // Streams that ended on their own still occupy their map slot
        // until something touches the router.
        self.streams.retain(|_, handle| !handle.is_finished());

        if self.streams.contains_key(&stream_id) {
            self.services.events.emit(Event::ProtocolError {
                request_id: Some(request_id.to_string()),
                message: format!("stream id {stream_id:?} is already in use"),
            });
            return;
        }

        let project = match self.defaults.resolve(&file) {
            Ok(project) => project,
            Err(err) => {
                // Fatal at stream creation: the stream never starts.
                self.services.events.emit(Event::StreamStopped {
                    stream_id,
                    reason: err.reason().into(),
                    message: err.to_string(),
                    diagnostic: None,
                });
                return;
            }
        };

        if device.is_empty() {
            device.udid = self.defaults.device_for(&file);
        }

        let spec = StreamSpec { stream_id: stream_id.clone(), file, selector, device, project };
        let handle = stream::spawn(spec, self.services.clone());
        self.streams.insert(stream_id, handle);
    }

    async fn stop_all(&mut self) {
        let handles: Vec<StreamHandle> =
            self.streams.drain().map(|(_, handle)| handle).collect();
        futures_util::future::join_all(handles.into_iter().map(StreamHandle::stop)).await;
    }

    fn unknown_stream(&self, request_id: Option<String>, stream_id: &str) {
        self.services.events.emit(Event::ProtocolError {
            request_id,
            message: format!("no stream with id {stream_id:?}"),
        });
    }
}
