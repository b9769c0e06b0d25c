//! Process Supervisor (C7): per-stream lifecycle, log routing, crash
//! handling. Each stream is driven by its own actor task reached through an
//! mpsc request channel with oneshot replies, batched child-process log
//! collection via parallel start/stop. A second task per running child
//! drains its output and detects exit/crash independently of the command
//! loop, reporting back through the same mailbox.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::command;
use crate::encoder::EncoderSelector;
use crate::error::{AppError, Result};
use crate::events::{Event, EventBus, LogEntry, LogLevel, StreamMetrics};
use crate::model::{Stream, StreamSpec, ValidationRecord};
use crate::utils::net::bind_udp_socket;
use crate::utils::throttle::LogThrottler;

pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_command: Option<Vec<String>>,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        Self {
            state: ProcessState::Idle,
            restart_count: 0,
            last_error: None,
            last_command: None,
        }
    }
}

/// Which fd a line came from, for level-classification purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
}

/// A running child process, abstracted so tests can supply a fake.
#[async_trait]
pub trait ChildHandle: Send {
    async fn next_line(&mut self) -> Option<(LineSource, String)>;
    /// Waits for exit, returning the exit code (0 = success).
    async fn wait(&mut self) -> i32;
    async fn kill(&mut self);
}

/// Host-supplied capability: spawn the encoder binary.
#[async_trait]
pub trait EncoderRunner: Send + Sync {
    async fn spawn(&self, argv: &[String]) -> Result<Box<dyn ChildHandle>>;
}

/// Classifies an encoder log line into a level using keyword rules applied
/// to child-process output.
pub fn classify_level(line: &str, source: LineSource) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("failed") || lower.contains("cannot") {
        LogLevel::Error
    } else if lower.contains("warn") || lower.contains("deprecated") {
        LogLevel::Warn
    } else if source == LineSource::Stderr {
        LogLevel::Info
    } else {
        LogLevel::Debug
    }
}

/// Parse one `-progress` key=value line. Returns `true` once a full report
/// has been accumulated (`progress=continue` or `progress=end`).
pub fn apply_progress_field(metrics: &mut StreamMetrics, key: &str, value: &str) -> bool {
    match key {
        "fps" => metrics.fps = value.parse().ok(),
        "drop_frames" => metrics.dropped = value.parse().ok(),
        "dup_frames" => metrics.duplicate = value.parse().ok(),
        "speed" => {
            metrics.speed = value.trim_end_matches('x').parse().ok();
        }
        "progress" => return true,
        _ => {}
    }
    false
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    Restart(oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<ProcessInfo>),
    /// Current runtime `Stream` object, `None` before the first `Start`.
    StreamInfo(oneshot::Sender<Option<Stream>>),
    UpdateSpec(StreamSpec, oneshot::Sender<Result<()>>),
    /// Applied before a device-driven restart so the next `current_command`
    /// reflects the new device path/readiness instead of the one fixed at
    /// `register` time.
    UpdateDevice {
        device_path: Option<String>,
        device_ready: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Reported by the watcher task when its child exits, tagged with the
    /// generation it was spawned under so a stale report from a
    /// already-replaced child is ignored.
    ChildExited { generation: u64, code: i32 },
    Shutdown,
}

struct ActorState {
    spec: StreamSpec,
    device_path: Option<String>,
    device_ready: bool,
    encoder_override: Option<String>,
    info: ProcessInfo,
    generation: u64,
    /// Set while a `Stop`/`Restart` is in flight so the watcher's exit
    /// report is treated as a clean shutdown rather than a crash.
    stopping: bool,
    kill_tx: Option<oneshot::Sender<()>>,
    stop_ack_rx: Option<oneshot::Receiver<()>>,
    log_throttle: Arc<LogThrottler>,
    /// Bound once on first `Start` and reused across restarts so the argv's
    /// `-progress` target stays stable for spec-equality comparisons.
    progress_addr: Option<SocketAddr>,
    progress_task: Option<JoinHandle<()>>,
    stream: Option<Stream>,
}

struct Actor {
    state: ActorState,
    runner: Arc<dyn EncoderRunner>,
    bus: Arc<EventBus>,
    validation: ValidationRecord,
    rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    seq: Arc<AtomicU64>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Start(reply) => {
                    let _ = reply.send(self.do_start().await);
                }
                Command::Stop(reply) => {
                    let _ = reply.send(self.do_stop().await);
                }
                Command::Restart(reply) => {
                    let stop = self.do_stop().await;
                    let result = match stop {
                        Ok(()) => self.do_start().await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.state.info.clone());
                }
                Command::StreamInfo(reply) => {
                    let _ = reply.send(self.state.stream.clone());
                }
                Command::UpdateDevice {
                    device_path,
                    device_ready,
                    reply,
                } => {
                    self.state.device_path = device_path;
                    self.state.device_ready = device_ready;
                    if let Some(stream) = self.state.stream.as_mut() {
                        stream.enabled = device_ready;
                    }
                    let _ = reply.send(Ok(()));
                }
                Command::UpdateSpec(spec, reply) => {
                    let old_command = self.state.info.last_command.clone();
                    self.state.spec = spec;
                    let new_command = self.current_command();
                    let result = if old_command.is_some() && old_command != Some(new_command) {
                        let stop = self.do_stop().await;
                        match stop {
                            Ok(()) => self.do_start().await,
                            Err(e) => Err(e),
                        }
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(result);
                }
                Command::ChildExited { generation, code } => {
                    if generation != self.state.generation {
                        continue;
                    }
                    if self.state.stopping {
                        self.state.stopping = false;
                        self.state.info.state = ProcessState::Idle;
                    } else if code != 0 {
                        self.state.info.state = ProcessState::Error;
                        self.state.info.last_error = Some(format!("exited with code {code}"));
                        self.bus.publish(Event::StreamCrashed {
                            stream_id: self.state.spec.id.clone(),
                            device_id: Some(self.state.spec.device.clone()),
                            ts: chrono::Utc::now(),
                        });
                    } else {
                        self.state.info.state = ProcessState::Idle;
                    }
                }
                Command::Shutdown => {
                    let _ = self.do_stop().await;
                    if let Some(task) = self.state.progress_task.take() {
                        task.abort();
                    }
                    break;
                }
            }
        }
    }

    fn current_command(&self) -> Vec<String> {
        let choice = EncoderSelector::select(
            self.state.spec.ffmpeg.codec,
            &self.validation,
            self.state.encoder_override.as_deref(),
        );
        let endpoint = self
            .state
            .progress_addr
            .map(|addr| format!("udp://{addr}"))
            .unwrap_or_else(|| "udp://127.0.0.1:0".to_string());
        command::synthesize(
            &self.state.spec,
            &choice,
            self.state.device_path.as_deref(),
            self.state.device_ready,
            &endpoint,
        )
    }

    /// Binds the per-stream progress listener on first start and spawns the
    /// reader task that drives `apply_progress_field` and publishes
    /// `StreamMetricsUpdate`. A no-op on subsequent restarts.
    fn ensure_progress_listener(&mut self) -> Result<()> {
        if self.state.progress_addr.is_some() {
            return Ok(());
        }
        let std_socket = bind_udp_socket("127.0.0.1:0".parse().unwrap())
            .map_err(|e| AppError::Internal(format!("progress listener bind failed: {e}")))?;
        let socket = tokio::net::UdpSocket::from_std(std_socket)
            .map_err(|e| AppError::Internal(format!("progress listener bind failed: {e}")))?;
        let addr = socket
            .local_addr()
            .map_err(|e| AppError::Internal(format!("progress listener bind failed: {e}")))?;
        self.state.progress_addr = Some(addr);

        let bus = self.bus.clone();
        let stream_id = self.state.spec.id.clone();
        self.state.progress_task = Some(tokio::spawn(read_progress_reports(socket, bus, stream_id)));
        Ok(())
    }

    async fn do_start(&mut self) -> Result<()> {
        self.state.info.state = ProcessState::Starting;
        if let Err(e) = self.ensure_progress_listener() {
            self.state.info.state = ProcessState::Error;
            self.state.info.last_error = Some(e.to_string());
            return Err(e);
        }
        let argv = self.current_command();
        self.state.info.last_command = Some(argv.clone());

        let mut child = match self.runner.spawn(&argv).await {
            Ok(c) => c,
            Err(e) => {
                self.state.info.state = ProcessState::Error;
                self.state.info.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        self.state.generation += 1;
        let generation = self.state.generation;
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (ack_tx, ack_rx) = oneshot::channel::<()>();
        self.state.kill_tx = Some(kill_tx);
        self.state.stop_ack_rx = Some(ack_rx);

        let bus = self.bus.clone();
        let throttle = self.state.log_throttle.clone();
        let seq = self.seq.clone();
        let module = format!("supervisor.{}", self.state.spec.id);
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut kill_rx => {
                        child.kill().await;
                        break;
                    }
                    line = child.next_line() => {
                        match line {
                            Some((source, text)) => {
                                if throttle.should_log(&text) {
                                    publish_line(&bus, &seq, &module, source, text);
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let code = child.wait().await;
            let _ = ack_tx.send(());
            let _ = self_tx.send(Command::ChildExited { generation, code }).await;
        });

        self.state.info.state = ProcessState::Running;
        self.state.stream = Some(Stream {
            id: self.state.spec.id.clone(),
            device_id: self.state.spec.device.clone(),
            codec: self.state.spec.ffmpeg.codec,
            start_time: chrono::Utc::now(),
            enabled: self.state.device_ready,
            progress_endpoint: self
                .state
                .progress_addr
                .expect("progress listener bound before spawn"),
        });
        self.publish_log(LogLevel::Info, format!("stream {} started", self.state.spec.id));
        Ok(())
    }

    async fn do_stop(&mut self) -> Result<()> {
        let Some(kill_tx) = self.state.kill_tx.take() else {
            self.state.info.state = ProcessState::Idle;
            return Ok(());
        };
        self.state.info.state = ProcessState::Stopping;
        self.state.stopping = true;
        let _ = kill_tx.send(());

        if let Some(ack_rx) = self.state.stop_ack_rx.take() {
            let _ = tokio::time::timeout(STOP_GRACE, ack_rx).await;
        }
        // The watcher task's `ChildExited` message, once it arrives, flips
        // `stopping` back to false and lands on `Idle`; reflect that eagerly
        // so callers observing state right after `stop()` see it settled.
        self.state.info.state = ProcessState::Idle;
        Ok(())
    }

    fn publish_log(&mut self, level: LogLevel, message: String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = LogEntry {
            seq,
            timestamp: chrono::Utc::now(),
            level,
            module: format!("supervisor.{}", self.state.spec.id),
            message,
            attributes: Default::default(),
        };
        self.bus.publish(Event::Log { entry });
    }
}

fn publish_line(bus: &EventBus, seq: &AtomicU64, module: &str, source: LineSource, text: String) {
    let level = classify_level(&text, source);
    let seq = seq.fetch_add(1, Ordering::Relaxed);
    bus.publish(Event::Log {
        entry: LogEntry {
            seq,
            timestamp: chrono::Utc::now(),
            level,
            module: module.to_string(),
            message: text,
            attributes: Default::default(),
        },
    });
}

/// Drains `-progress` datagrams, feeding each `key=value` line through
/// `apply_progress_field` and publishing a `StreamMetricsUpdate` once a
/// report completes (`progress=continue`/`progress=end`). Returns once the
/// socket is closed (actor shutdown aborts this task directly).
async fn read_progress_reports(socket: tokio::net::UdpSocket, bus: Arc<EventBus>, stream_id: String) {
    let mut buf = [0u8; 2048];
    let mut metrics = StreamMetrics::default();
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        let report = String::from_utf8_lossy(&buf[..len]);
        for line in report.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if apply_progress_field(&mut metrics, key.trim(), value.trim()) {
                bus.publish(Event::StreamMetricsUpdate {
                    stream_id: stream_id.clone(),
                    metrics: std::mem::take(&mut metrics),
                    ts: chrono::Utc::now(),
                });
            }
        }
    }
}

struct Handle {
    tx: mpsc::Sender<Command>,
    device_id: String,
}

/// Owns one actor task handle per known stream.
pub struct ProcessSupervisor {
    runner: Arc<dyn EncoderRunner>,
    bus: Arc<EventBus>,
    handles: Mutex<HashMap<String, Handle>>,
}

impl ProcessSupervisor {
    pub fn new(runner: Arc<dyn EncoderRunner>, bus: Arc<EventBus>) -> Self {
        Self {
            runner,
            bus,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a stream (creating its actor) without starting it.
    pub async fn register(
        &self,
        spec: StreamSpec,
        device_path: Option<String>,
        device_ready: bool,
        encoder_override: Option<String>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let id = spec.id.clone();
        let device_id = spec.device.clone();
        let actor = Actor {
            state: ActorState {
                spec,
                device_path,
                device_ready,
                encoder_override,
                info: ProcessInfo::default(),
                generation: 0,
                stopping: false,
                kill_tx: None,
                stop_ack_rx: None,
                log_throttle: Arc::new(LogThrottler::default()),
                progress_addr: None,
                progress_task: None,
                stream: None,
            },
            runner: self.runner.clone(),
            bus: self.bus.clone(),
            validation: ValidationRecord::default(),
            rx,
            self_tx: tx.clone(),
            seq: Arc::new(AtomicU64::new(1)),
        };
        tokio::spawn(actor.run());
        self.handles.lock().await.insert(id, Handle { tx, device_id });
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.send(id, Command::Start).await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.send(id, Command::Stop).await
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        self.send(id, Command::Restart).await
    }

    pub async fn status(&self, id: &str) -> Result<ProcessInfo> {
        let handles = self.handles.lock().await;
        let handle = handles
            .get(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(Command::Status(tx))
            .await
            .map_err(|_| AppError::StreamNotFound(id.to_string()))?;
        rx.await.map_err(|_| AppError::Internal("actor gone".into()))
    }

    pub async fn is_running(&self, id: &str) -> bool {
        matches!(self.status(id).await, Ok(info) if info.state == ProcessState::Running)
    }

    /// Current runtime `Stream` object (§3), `Ok(None)` before the first
    /// `start()`.
    pub async fn stream_info(&self, id: &str) -> Result<Option<Stream>> {
        let handles = self.handles.lock().await;
        let handle = handles
            .get(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(Command::StreamInfo(tx))
            .await
            .map_err(|_| AppError::StreamNotFound(id.to_string()))?;
        rx.await.map_err(|_| AppError::Internal("actor gone".into()))
    }

    pub async fn update_spec(&self, id: &str, spec: StreamSpec) -> Result<()> {
        let handles = self.handles.lock().await;
        let handle = handles
            .get(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(Command::UpdateSpec(spec, tx))
            .await
            .map_err(|_| AppError::StreamNotFound(id.to_string()))?;
        rx.await.map_err(|_| AppError::Internal("actor gone".into()))?
    }

    pub async fn start_all(&self) {
        let handles = self.handles.lock().await;
        let ids: Vec<String> = handles.keys().cloned().collect();
        drop(handles);
        join_all(ids.iter().map(|id| self.start(id))).await;
    }

    pub async fn stop_all(&self) {
        let handles = self.handles.lock().await;
        let ids: Vec<String> = handles.keys().cloned().collect();
        drop(handles);
        join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Device-driven enable/disable: call when `device_id`'s readiness (or
    /// its resolved kernel path) changes. Updates each matching actor's
    /// `device_ready`/`device_path` before restarting so the overlay/source
    /// the new command synthesizes from actually reflects the change.
    pub async fn on_device_ready_changed(&self, device_id: &str, ready: bool, device_path: Option<String>) {
        let matching: Vec<String> = {
            let handles = self.handles.lock().await;
            handles
                .iter()
                .filter(|(_, h)| h.device_id == device_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in matching {
            let path = device_path.clone();
            let _ = self
                .send(&id, move |reply| Command::UpdateDevice {
                    device_path: path,
                    device_ready: ready,
                    reply,
                })
                .await;
            self.bus.publish(Event::StreamStateChanged {
                stream_id: id.clone(),
                enabled: ready,
                ts: chrono::Utc::now(),
            });
            let _ = self.restart(&id).await;
        }
    }

    /// Subscribes to `DeviceDiscovery` and applies device-driven restarts to
    /// every stream registered against the affected device (§4.7).
    pub async fn run_device_discovery_loop(self: Arc<Self>, bus: Arc<EventBus>) {
        let mut rx = bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(Event::DeviceDiscovery { device, .. }) => {
                    self.on_device_ready_changed(&device.device_id, device.ready, Some(device.kernel_path.clone()))
                        .await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn send(&self, id: &str, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let handles = self.handles.lock().await;
        let handle = handles
            .get(id)
            .ok_or_else(|| AppError::StreamNotFound(id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(make(tx))
            .await
            .map_err(|_| AppError::StreamNotFound(id.to_string()))?;
        rx.await.map_err(|_| AppError::Internal("actor gone".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Codec, FfmpegSpec, Quality, QualityMode};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeChild {
        lines: AsyncMutex<Vec<(LineSource, String)>>,
        exit_code: i32,
    }

    #[async_trait]
    impl ChildHandle for FakeChild {
        async fn next_line(&mut self) -> Option<(LineSource, String)> {
            self.lines.lock().await.pop()
        }
        async fn wait(&mut self) -> i32 {
            self.exit_code
        }
        async fn kill(&mut self) {}
    }

    struct FakeRunner {
        exit_code: i32,
    }
    #[async_trait]
    impl EncoderRunner for FakeRunner {
        async fn spawn(&self, _argv: &[String]) -> Result<Box<dyn ChildHandle>> {
            Ok(Box::new(FakeChild {
                lines: AsyncMutex::new(vec![(LineSource::Stderr, "frame=1 fps=30".into())]),
                exit_code: self.exit_code,
            }))
        }
    }

    fn ok_runner() -> Arc<FakeRunner> {
        Arc::new(FakeRunner { exit_code: 0 })
    }

    fn spec(id: &str) -> StreamSpec {
        StreamSpec {
            id: id.into(),
            name: "cam".into(),
            device: "usb-0000:00:14.0-1".into(),
            test_mode: true,
            custom_command: None,
            ffmpeg: FfmpegSpec {
                codec: Codec::H264,
                input_format: "v4l2".into(),
                resolution: "1280x720".into(),
                fps: 30,
                audio_device: None,
                options: vec![],
                quality: Quality {
                    mode: QualityMode::Vbr,
                    bitrate_kbps: 2000,
                },
            },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn start_transitions_to_running() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;

        sup.start("cam1").await.unwrap();
        let info = sup.status("cam1").await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
    }

    #[tokio::test]
    async fn stop_returns_to_idle() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;

        sup.start("cam1").await.unwrap();
        sup.stop("cam1").await.unwrap();
        let info = sup.status("cam1").await.unwrap();
        assert_eq!(info.state, ProcessState::Idle);
    }

    #[tokio::test]
    async fn status_on_unknown_stream_errors() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        assert!(sup.status("missing").await.is_err());
    }

    #[tokio::test]
    async fn update_with_identical_command_does_not_restart() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;
        sup.start("cam1").await.unwrap();

        let same_spec = spec("cam1");
        sup.update_spec("cam1", same_spec).await.unwrap();
        let info = sup.status("cam1").await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
    }

    #[tokio::test]
    async fn update_with_different_command_restarts() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;
        sup.start("cam1").await.unwrap();

        let mut changed = spec("cam1");
        changed.ffmpeg.fps = 60;
        sup.update_spec("cam1", changed).await.unwrap();
        let info = sup.status("cam1").await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
        assert!(info.last_command.unwrap().iter().any(|a| a == "60"));
    }

    #[tokio::test]
    async fn crash_publishes_stream_crashed_and_sets_error() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let sup = ProcessSupervisor::new(Arc::new(FakeRunner { exit_code: 1 }), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;

        sup.start("cam1").await.unwrap();

        // Drain the startup log entry, then expect StreamCrashed.
        let mut saw_crash = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(Event::StreamCrashed { stream_id, .. })) => {
                    assert_eq!(stream_id, "cam1");
                    saw_crash = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_crash, "expected a StreamCrashed event");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = sup.status("cam1").await.unwrap();
        assert_eq!(info.state, ProcessState::Error);
    }

    #[test]
    fn classify_level_detects_error_keywords() {
        assert_eq!(
            classify_level("Error opening input", LineSource::Stderr),
            LogLevel::Error
        );
        assert_eq!(
            classify_level("deprecated pixel format", LineSource::Stderr),
            LogLevel::Warn
        );
    }

    #[test]
    fn progress_fields_accumulate_until_marker() {
        let mut metrics = StreamMetrics::default();
        assert!(!apply_progress_field(&mut metrics, "fps", "29.97"));
        assert!(!apply_progress_field(&mut metrics, "drop_frames", "2"));
        assert!(apply_progress_field(&mut metrics, "progress", "continue"));
        assert_eq!(metrics.fps, Some(29.97));
        assert_eq!(metrics.dropped, Some(2));
    }

    #[tokio::test]
    async fn stream_info_reflects_runtime_state() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;

        assert!(sup.stream_info("cam1").await.unwrap().is_none());

        sup.start("cam1").await.unwrap();
        let stream = sup.stream_info("cam1").await.unwrap().expect("stream running");
        assert_eq!(stream.id, "cam1");
        assert_eq!(stream.device_id, "usb-0000:00:14.0-1");
        assert!(stream.enabled);
        assert_ne!(stream.progress_endpoint.port(), 0);
    }

    #[tokio::test]
    async fn progress_datagram_publishes_metrics_update() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;
        sup.start("cam1").await.unwrap();

        let stream = sup.stream_info("cam1").await.unwrap().expect("stream running");
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"fps=29.97\ndrop_frames=1\nprogress=continue\n", stream.progress_endpoint)
            .unwrap();

        let mut saw_metrics = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(Event::StreamMetricsUpdate { stream_id, metrics, .. })) => {
                    assert_eq!(stream_id, "cam1");
                    assert_eq!(metrics.fps, Some(29.97));
                    assert_eq!(metrics.dropped, Some(1));
                    saw_metrics = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_metrics, "expected a StreamMetricsUpdate event");
    }

    #[tokio::test]
    async fn device_ready_change_updates_overlay_after_restart() {
        let bus = Arc::new(EventBus::new());
        let sup = ProcessSupervisor::new(ok_runner(), bus);
        sup.register(spec("cam1"), Some("/dev/video0".into()), true, None).await;
        sup.start("cam1").await.unwrap();

        let info = sup.status("cam1").await.unwrap();
        assert!(info.last_command.unwrap().iter().any(|a| a.contains("TEST MODE")));

        sup.on_device_ready_changed("usb-0000:00:14.0-1", false, Some("/dev/video0".into()))
            .await;

        let info = sup.status("cam1").await.unwrap();
        assert!(info.last_command.unwrap().iter().any(|a| a.contains("NO SIGNAL")));
        let stream = sup.stream_info("cam1").await.unwrap().expect("stream running");
        assert!(!stream.enabled);
    }
}
