//! Server core: the engine registry, driver-fault blacklist, per-engine
//! broadcast loops, dashboard subscribers and the viewer session lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use mirror_platform::audio::AudioProvider;
use mirror_platform::clipboard::ClipboardProvider;
use mirror_platform::discovery::DiscoveryBeacon;
use mirror_platform::host::HostSampler;
use mirror_platform::input::{InputSink, NullInput};
use mirror_platform::source::{is_driver_fault, SourceOptions, SourceProvider, SourceTier};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::config::{ServerConfig, Tier};
use crate::engine::{Engine, EngineParams};
use crate::governor::Governor;
use crate::protocol::{self, ClientStats, ClientText, DashboardCommand, EventLevel, Payload, ServerText};
use crate::session::{guarded_send, InFlightMap, Viewer};
use crate::state;

/// How long a monitor stays forced-portable after a native-path fault.
pub const BLACKLIST_COOLDOWN: Duration = Duration::from_secs(60);
/// Pause between stopping an engine and constructing its replacement.
const DRIVER_SETTLE: Duration = Duration::from_millis(500);
/// Settling delay inside the software reset.
const RESET_SETTLE: Duration = Duration::from_secs(2);
/// Soft cap on delivering the join keyframe; missing it is not fatal.
const KEYFRAME_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Silence threshold after which one recovery keyframe is broadcast.
const RECOVERY_SILENCE: Duration = Duration::from_secs(2);

const MAX_WS_MESSAGE: usize = 16 * 1024 * 1024;

/// One engine bound to its viewers and control structures. Created and
/// destroyed only by the registry, under its mutex.
pub struct EngineSlot {
    pub engine: Arc<Engine>,
    pub governor: Mutex<Governor>,
    viewers: Mutex<HashMap<u64, Arc<Viewer>>>,
    force_keyframe: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineSlot {
    pub(crate) fn viewer_list(&self) -> Vec<Arc<Viewer>> {
        self.viewers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn contains_viewer(&self, id: u64) -> bool {
        self.viewers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn set_force_keyframe(&self) {
        self.force_keyframe.store(true, Ordering::SeqCst);
    }

    fn admit(&self, viewer: Arc<Viewer>) {
        self.viewers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(viewer.id, viewer);
    }

    fn evict(&self, id: u64) {
        self.viewers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn drain_viewers(&self) -> Vec<Arc<Viewer>> {
        self.viewers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, v)| v)
            .collect()
    }

    /// Cancels the broadcast tasks and hands the handles back so callers
    /// that need to await the unwind can.
    fn abort_tasks(&self) -> Vec<JoinHandle<()>> {
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles
    }
}

struct Registry {
    slots: HashMap<u32, Arc<EngineSlot>>,
    blacklist: HashMap<u32, Instant>,
}

/// External collaborators the core invokes through narrow seams.
pub struct Collaborators {
    pub input: Arc<dyn InputSink>,
    pub audio: Option<Arc<dyn AudioProvider>>,
    pub clipboard: Option<Arc<dyn ClipboardProvider>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            input: Arc::new(NullInput),
            audio: None,
            clipboard: None,
        }
    }
}

pub struct ServerCore {
    config: ServerConfig,
    provider: Arc<dyn SourceProvider>,
    input: Arc<dyn InputSink>,
    audio: Option<Arc<dyn AudioProvider>>,
    clipboard: Option<Arc<dyn ClipboardProvider>>,
    registry: tokio::sync::Mutex<Registry>,
    in_flight: Arc<InFlightMap>,
    dashboards: Mutex<HashMap<u64, Arc<Viewer>>>,
    current_monitor: AtomicU32,
    next_viewer_id: AtomicU64,
    state_path: PathBuf,
    host: HostSampler,
    aux_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerCore {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn SourceProvider>,
        collaborators: Collaborators,
        state_path: PathBuf,
    ) -> Arc<Self> {
        let monitor = state::load(&state_path).unwrap_or(config.monitor_id);
        Arc::new(Self {
            config,
            provider,
            input: collaborators.input,
            audio: collaborators.audio,
            clipboard: collaborators.clipboard,
            registry: tokio::sync::Mutex::new(Registry {
                slots: HashMap::new(),
                blacklist: HashMap::new(),
            }),
            in_flight: Arc::new(InFlightMap::default()),
            dashboards: Mutex::new(HashMap::new()),
            current_monitor: AtomicU32::new(monitor),
            next_viewer_id: AtomicU64::new(1),
            state_path,
            host: HostSampler::new(),
            aux_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn current_monitor(&self) -> u32 {
        self.current_monitor.load(Ordering::Relaxed)
    }

    pub(crate) fn provider(&self) -> &Arc<dyn SourceProvider> {
        &self.provider
    }

    pub(crate) fn host(&self) -> &HostSampler {
        &self.host
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Registered monitors, sorted.
    pub async fn engines(&self) -> Vec<u32> {
        let registry = self.registry.lock().await;
        let mut ids: Vec<u32> = registry.slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn slot(&self, monitor_id: u32) -> Option<Arc<EngineSlot>> {
        self.registry.lock().await.slots.get(&monitor_id).cloned()
    }

    pub async fn blacklist_until(&self, monitor_id: u32) -> Option<Instant> {
        self.registry.lock().await.blacklist.get(&monitor_id).copied()
    }

    pub async fn blacklist_len(&self) -> usize {
        self.registry.lock().await.blacklist.len()
    }

    /// Returns the slot for a monitor, building the engine if needed. The
    /// whole body runs under the registry mutex so no two callers race the
    /// construction. On construction failure the monitor is blacklisted and
    /// a single portable retry is made before the error propagates.
    pub async fn get_or_create_engine(
        self: &Arc<Self>,
        monitor_id: u32,
        force_portable: bool,
    ) -> Result<Arc<EngineSlot>> {
        let mut force = force_portable;
        loop {
            match self.try_create_engine(monitor_id, force).await {
                Ok(slot) => return Ok(slot),
                Err(e) if !force => {
                    tracing::warn!(
                        "engine init failed for monitor {monitor_id}, retrying portable: {e:#}"
                    );
                    sleep(DRIVER_SETTLE).await;
                    force = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_create_engine(
        self: &Arc<Self>,
        monitor_id: u32,
        mut force_portable: bool,
    ) -> Result<Arc<EngineSlot>> {
        let mut registry = self.registry.lock().await;

        if !force_portable {
            if let Some(until) = registry.blacklist.get(&monitor_id) {
                if Instant::now() < *until {
                    tracing::warn!("monitor {monitor_id} is in cool-down, forcing portable");
                    force_portable = true;
                }
            }
        }

        if !force_portable {
            if let Some(slot) = registry.slots.get(&monitor_id) {
                return Ok(slot.clone());
            }
        }

        if let Some(old) = registry.slots.remove(&monitor_id) {
            old.abort_tasks();
            old.engine.stop().await;
            sleep(DRIVER_SETTLE).await;
        }

        tracing::info!("creating engine for monitor {monitor_id} (force_portable={force_portable})");
        let cfg = self.config.effective();
        let prefer_native = cfg.optimize_capture_pipeline && !force_portable;
        let governor = Governor::new(cfg.mode, cfg.tier);
        let params = EngineParams {
            quality: cfg.webp_quality.clamp(1, 100),
            tile_size: governor.tile_size(),
            fps: governor.target_fps().min(cfg.frame_rate.max(1)),
        };
        let opts = SourceOptions {
            monitor_id,
            target_fps: params.fps,
            resolution: cfg.target_resolution(),
            draw_cursor: true,
            allow_unstable_fallback: cfg.enable_dxcam_fallback,
        };

        let provider = self.provider.clone();
        let opened = tokio::task::spawn_blocking(move || provider.open(&opts, prefer_native))
            .await
            .context("capture open task failed")?;
        let source = match opened {
            Ok(source) => source,
            Err(e) => {
                registry
                    .blacklist
                    .insert(monitor_id, Instant::now() + BLACKLIST_COOLDOWN);
                return Err(e);
            }
        };

        // A portable source answering a native request means the driver is
        // unhealthy; remember that for the cool-down window.
        if prefer_native && source.tier() == SourceTier::Portable {
            tracing::warn!(
                "native capture requested but {} answered; blacklisting monitor {monitor_id} for {}s",
                source.identity(),
                BLACKLIST_COOLDOWN.as_secs()
            );
            registry
                .blacklist
                .insert(monitor_id, Instant::now() + BLACKLIST_COOLDOWN);
        }

        let audio = match (&self.audio, cfg.tier) {
            (Some(audio), tier) if tier != Tier::Flow => audio.open(monitor_id),
            _ => None,
        };

        let engine = match Engine::new(monitor_id, source, audio, params) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                registry
                    .blacklist
                    .insert(monitor_id, Instant::now() + BLACKLIST_COOLDOWN);
                return Err(e);
            }
        };

        let slot = Arc::new(EngineSlot {
            engine,
            governor: Mutex::new(governor),
            viewers: Mutex::new(HashMap::new()),
            force_keyframe: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });
        registry.slots.insert(monitor_id, slot.clone());

        let video = tokio::spawn(video_broadcast_loop(self.clone(), monitor_id, slot.clone()));
        let audio_task = tokio::spawn(audio_broadcast_loop(self.clone(), monitor_id, slot.clone()));
        slot.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([video, audio_task]);

        Ok(slot)
    }

    async fn slot_is_live(&self, monitor_id: u32, slot: &Arc<EngineSlot>) -> bool {
        let registry = self.registry.lock().await;
        registry
            .slots
            .get(&monitor_id)
            .map(|s| Arc::ptr_eq(s, slot))
            .unwrap_or(false)
    }

    /// Spawns one guarded send per idle viewer; viewers with a send already
    /// in flight are skipped and this payload is simply dropped for them.
    fn fan_out(&self, viewers: &[Arc<Viewer>], payload: &Payload) {
        let bytes = payload.bytes();
        for viewer in viewers {
            if self.in_flight.claim(viewer.id) {
                let guard = tokio::spawn(guarded_send(
                    viewer.clone(),
                    bytes.clone(),
                    self.in_flight.clone(),
                ));
                self.in_flight.attach(viewer.id, guard);
            }
        }
    }

    /// Known driver faults trigger a portable rebuild and end the loop that
    /// reported them; anything else is logged and the loop continues.
    fn handle_loop_fault(self: &Arc<Self>, monitor_id: u32, error: &anyhow::Error) -> bool {
        let msg = format!("{error:#}");
        if is_driver_fault(&msg) {
            tracing::warn!("capture fault on monitor {monitor_id}, rebuilding portable: {msg}");
            let core = self.clone();
            tokio::spawn(async move {
                if let Err(e) = core.get_or_create_engine(monitor_id, true).await {
                    tracing::error!("portable rebuild for monitor {monitor_id} failed: {e:#}");
                }
            });
            true
        } else {
            tracing::error!("engine loop error on monitor {monitor_id}: {msg}");
            false
        }
    }

    fn version_message(&self, monitor_id: u32) -> ServerText {
        ServerText::Version {
            version: protocol::PROTOCOL_VERSION.to_string(),
            monitor_id,
            tier: self.config.tier,
            language: self.config.language.clone(),
        }
    }

    /// Pushes a lifecycle event to every dashboard subscriber.
    pub fn broadcast_event(&self, message: &str, level: EventLevel) {
        let event = ServerText::SysEvent {
            message: message.to_string(),
            level,
        };
        let Ok(json) = serde_json::to_string(&event) else {
            return;
        };
        let dashboards: Vec<Arc<Viewer>> = self
            .dashboards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for dashboard in dashboards {
            let json = json.clone();
            tokio::spawn(async move {
                let _ = dashboard.send_text(json).await;
            });
        }
    }

    pub(crate) fn dashboard_count(&self) -> usize {
        self.dashboards.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Moves every viewer to `target`, stopping the other engines first so
    /// backends sharing a driver handle never see a stop/start race.
    pub async fn switch_monitor(self: &Arc<Self>, target: u32) -> Result<()> {
        tracing::info!("switching all viewers to monitor {target}");

        let (all_viewers, stopped) = {
            let mut registry = self.registry.lock().await;
            let mut viewers = Vec::new();
            for slot in registry.slots.values() {
                viewers.extend(slot.drain_viewers());
            }
            let others: Vec<u32> = registry
                .slots
                .keys()
                .filter(|&&m| m != target)
                .copied()
                .collect();
            let mut removed = Vec::new();
            for monitor in others {
                if let Some(slot) = registry.slots.remove(&monitor) {
                    removed.push(slot);
                }
            }
            (viewers, removed)
        };

        for slot in stopped {
            slot.abort_tasks();
            slot.engine.stop().await;
        }

        self.current_monitor.store(target, Ordering::Relaxed);
        if let Err(e) = state::save(&self.state_path, target) {
            tracing::warn!("failed to persist monitor selection: {e:#}");
        }

        let slot = self.get_or_create_engine(target, false).await?;
        for viewer in all_viewers {
            viewer.set_monitor_id(target);
            slot.admit(viewer.clone());
            if let Ok(json) = serde_json::to_string(&self.version_message(target)) {
                let _ = viewer.send_text(json).await;
            }
        }
        // Re-homed viewers hold stale state until the next keyframe.
        slot.set_force_keyframe();
        Ok(())
    }

    /// Purges every piece of in-memory state that could hold a stuck
    /// resource, then rebuilds the engine for the last active monitor.
    pub async fn software_reset(self: &Arc<Self>) -> Result<()> {
        tracing::warn!("initiating software reset (buffer purge)");
        self.broadcast_event("SOFTWARE RESET INITIATED", EventLevel::Error);

        let remembered = self.current_monitor.load(Ordering::Relaxed);

        let slots: Vec<Arc<EngineSlot>> = {
            let mut registry = self.registry.lock().await;
            registry.slots.drain().map(|(_, slot)| slot).collect()
        };

        // Hard-close viewer channels first so OS-level buffers are dropped
        // rather than drained into dead sessions.
        for slot in &slots {
            for viewer in slot.drain_viewers() {
                viewer.close_going_away("SOFTWARE_RESET").await;
            }
        }

        for slot in &slots {
            for handle in slot.abort_tasks() {
                let _ = handle.await;
            }
            slot.engine.stop().await;
        }

        self.registry.lock().await.blacklist.clear();
        self.in_flight.clear();
        tracing::info!("engines, send queues and blacklist purged");

        sleep(RESET_SETTLE).await;

        self.get_or_create_engine(remembered, false).await?;
        self.broadcast_event("SYSTEM RECOVERED", EventLevel::Info);
        tracing::info!("software reset complete");
        Ok(())
    }

    /// Full shutdown: cancels every task, stops every engine, closes every
    /// viewer. The registry lock is never held across the engine stops.
    pub async fn stop(self: &Arc<Self>) {
        tracing::info!("server stopping");
        for handle in self
            .aux_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        let slots: Vec<Arc<EngineSlot>> = {
            let mut registry = self.registry.lock().await;
            registry.blacklist.clear();
            registry.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            for viewer in slot.drain_viewers() {
                viewer.close_going_away("SERVER_SHUTDOWN").await;
            }
            for handle in slot.abort_tasks() {
                let _ = handle.await;
            }
            slot.engine.stop().await;
        }
        self.in_flight.clear();
    }

    // --- Connection handling ---

    /// Accepts one raw socket as a viewer session.
    pub async fn handle_socket<S>(self: Arc<Self>, stream: S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_WS_MESSAGE);
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config))
            .await
            .context("websocket handshake failed")?;
        self.handle_connection(ws, addr).await
    }

    async fn handle_connection<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        addr: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let id = self.next_viewer_id.fetch_add(1, Ordering::Relaxed);
        let viewer = Viewer::new(id, addr, Box::new(sink));
        tracing::info!("viewer connected: {addr}");

        let result = self.clone().run_session(&viewer, &mut stream).await;

        {
            let registry = self.registry.lock().await;
            for slot in registry.slots.values() {
                slot.evict(id);
            }
        }
        self.dashboards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.in_flight.abort(id);
        tracing::info!("viewer disconnected: {addr}");
        result
    }

    async fn run_session<S>(
        self: Arc<Self>,
        viewer: &Arc<Viewer>,
        stream: &mut SplitStream<WebSocketStream<S>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let monitor_id = self.current_monitor();

        // Handshake: the version record goes out before anything else.
        viewer
            .send_text(serde_json::to_string(&self.version_message(monitor_id))?)
            .await
            .context("handshake send failed")?;

        // Admission, then the join keyframe. A viewer that misses it paints
        // on the next broadcast keyframe instead of being dropped.
        let slot = self.get_or_create_engine(monitor_id, false).await?;
        slot.admit(viewer.clone());
        viewer.set_monitor_id(monitor_id);

        let join = timeout(KEYFRAME_JOIN_TIMEOUT, async {
            let payload = slot.engine.keyframe_payload().await?;
            viewer.send_binary(payload.bytes()).await?;
            Ok::<_, anyhow::Error>(())
        })
        .await;
        match join {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("initial keyframe for {addr} failed: {e:#}", addr = viewer.addr),
            Err(_) => tracing::warn!("initial keyframe for {} timed out", viewer.addr),
        }

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("viewer {} stream error: {e}", viewer.addr);
                    break;
                }
            };
            match message {
                WsMessage::Binary(data) => {
                    if protocol::is_input_event(&data) && self.config.enable_input_control {
                        if let Err(e) = self.input.inject(&data) {
                            tracing::debug!("input injection failed: {e:#}");
                        }
                    }
                }
                WsMessage::Text(text) => self.clone().handle_text(viewer, text.as_ref()).await,
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_text(self: Arc<Self>, viewer: &Arc<Viewer>, text: &str) {
        let parsed: ClientText = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("ignoring malformed viewer message: {e}");
                return;
            }
        };

        match parsed {
            ClientText::ClientStats(stats) => self.apply_client_stats(viewer, stats).await,
            ClientText::Heartbeat { timestamp } => {
                if let Ok(json) = serde_json::to_string(&ServerText::HeartbeatAck { timestamp }) {
                    let _ = viewer.send_text(json).await;
                }
            }
            ClientText::DashboardIdent => {
                {
                    let registry = self.registry.lock().await;
                    for slot in registry.slots.values() {
                        slot.evict(viewer.id);
                    }
                }
                self.dashboards
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(viewer.id, viewer.clone());
                tracing::info!("viewer {} promoted to dashboard", viewer.addr);
            }
            ClientText::DashboardCmd {
                command,
                monitor_id,
            } => match command {
                DashboardCommand::SoftwareReset => {
                    if let Err(e) = self.software_reset().await {
                        tracing::error!("software reset failed: {e:#}");
                    }
                }
                DashboardCommand::ForceRefresh => {
                    {
                        let registry = self.registry.lock().await;
                        for slot in registry.slots.values() {
                            slot.set_force_keyframe();
                        }
                    }
                    self.broadcast_event("HD Refresh Triggered", EventLevel::Warning);
                }
                DashboardCommand::SwitchMonitor => {
                    if let Err(e) = self.switch_monitor(monitor_id).await {
                        tracing::error!("monitor switch failed: {e:#}");
                    }
                }
            },
        }
    }

    async fn apply_client_stats(&self, viewer: &Arc<Viewer>, stats: ClientStats) {
        viewer.set_device_name(&stats.device_name);

        let slot = {
            let registry = self.registry.lock().await;
            registry.slots.get(&viewer.monitor_id()).cloned()
        };
        let Some(slot) = slot else {
            return;
        };

        let (quality, tile_size, fps) = {
            let mut governor = slot.governor.lock().unwrap_or_else(|e| e.into_inner());
            governor.update(&stats);
            (governor.quality(), governor.tile_size(), governor.target_fps())
        };

        // Only reconfigure the engine when a decision actually moved.
        let params = slot.engine.params();
        if quality != params.quality {
            slot.engine.set_quality(quality);
            tracing::debug!("governor applied quality {quality}");
        }
        if tile_size != params.tile_size {
            slot.engine.set_tile_size(tile_size);
            tracing::debug!("governor applied tile size {tile_size}");
        }
        if fps != params.fps {
            slot.engine.set_fps(fps);
        }
    }

    // --- Listening ---

    /// Port seeking: tries `port`, `port+1`, `port+2`; startup fails after
    /// three occupied ports.
    pub async fn bind_with_seek(port: u16) -> Result<(TcpListener, u16)> {
        let mut last_err = None;
        for offset in 0..3u16 {
            let candidate = port.saturating_add(offset);
            match TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?.port();
                    return Ok((listener, bound));
                }
                Err(e) => {
                    tracing::warn!("port {candidate} occupied, trying next");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => {
                Err(anyhow::Error::from(e).context("no available ports after 3 attempts"))
            }
            None => bail!("no ports attempted"),
        }
    }

    /// Runs the accept loop(s). With TLS configured, a plain-TCP listener is
    /// also bound one port up for clients that cannot negotiate it.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<tokio_native_tls::TlsAcceptor>,
        discovery: Option<Arc<dyn DiscoveryBeacon>>,
    ) -> Result<()> {
        let port = listener.local_addr()?.port();

        if tls.is_some() {
            let plain_port = port.saturating_add(1);
            match TcpListener::bind(("0.0.0.0", plain_port)).await {
                Ok(plain) => {
                    tracing::info!("plain websocket fallback on port {plain_port}");
                    let core = self.clone();
                    let task = tokio::spawn(accept_loop(core, plain, None));
                    self.aux_tasks
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(task);
                }
                Err(e) => tracing::warn!("could not bind fallback port {plain_port}: {e}"),
            }
        }

        if let Some(beacon) = &discovery {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Host".to_string());
            if let Err(e) = beacon.start(&format!("LAN Mirror ({host})"), port).await {
                tracing::warn!("discovery advertisement failed: {e:#}");
            }
        }

        if self.clipboard.is_some() {
            let core = self.clone();
            let task = tokio::spawn(clipboard_loop(core));
            self.aux_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(task);
        }

        tracing::info!("mirror server active on port {port}");
        accept_loop(self, listener, tls).await;
        Ok(())
    }
}

async fn accept_loop(
    core: Arc<ServerCore>,
    listener: TcpListener,
    tls: Option<tokio_native_tls::TlsAcceptor>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let core = core.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => core.handle_socket(tls_stream, addr).await,
                    Err(e) => {
                        tracing::debug!("tls handshake with {addr} failed: {e}");
                        return;
                    }
                },
                None => core.handle_socket(stream, addr).await,
            };
            if let Err(e) = result {
                tracing::debug!("session with {addr} ended: {e:#}");
            }
        });
    }
}

/// Per-engine video fan-out. Runs while its slot is registered; a driver
/// fault hands the monitor to a portable replacement loop and exits.
async fn video_broadcast_loop(core: Arc<ServerCore>, monitor_id: u32, slot: Arc<EngineSlot>) {
    tracing::info!("broadcast loop for monitor {monitor_id} active");
    let mut last_change = Instant::now();
    let mut recovery_sent = false;

    loop {
        if !core.slot_is_live(monitor_id, &slot).await {
            break;
        }

        let viewers = slot.viewer_list();

        // No viewers: capture at 1 Hz so dashboard snapshots stay fresh.
        if viewers.is_empty() {
            let _ = slot.engine.next_payload().await;
            sleep(Duration::from_secs(1)).await;
            continue;
        }

        // Congestion skip: producing more while a send is stuck only grows
        // the backlog.
        if viewers.iter().any(|v| core.in_flight.is_sending(v.id)) {
            sleep(Duration::from_millis(10)).await;
            continue;
        }

        if slot.force_keyframe.load(Ordering::SeqCst) {
            match slot.engine.keyframe_payload().await {
                Ok(payload) => {
                    core.fan_out(&viewers, &payload);
                    slot.force_keyframe.store(false, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => {
                    if core.handle_loop_fault(monitor_id, &e) {
                        return;
                    }
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            }
        }

        match slot.engine.next_payload().await {
            Ok(Some(payload)) => {
                last_change = Instant::now();
                recovery_sent = false;
                core.fan_out(&viewers, &payload);
            }
            Ok(None) => {
                if !recovery_sent && last_change.elapsed() > RECOVERY_SILENCE {
                    if let Ok(payload) = slot.engine.keyframe_payload().await {
                        core.fan_out(&viewers, &payload);
                        recovery_sent = true;
                    }
                }
            }
            Err(e) => {
                if core.handle_loop_fault(monitor_id, &e) {
                    return;
                }
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        }

        let fps = slot.engine.params().fps.max(1);
        sleep(Duration::from_secs_f64(1.0 / f64::from(fps))).await;
    }
    tracing::debug!("broadcast loop for monitor {monitor_id} finished");
}

/// Per-engine audio fan-out. Audio skips the in-flight slot machinery; a
/// late packet is worthless, so sends are direct with the same 1 s cap.
async fn audio_broadcast_loop(core: Arc<ServerCore>, monitor_id: u32, slot: Arc<EngineSlot>) {
    if !slot.engine.has_audio() {
        return;
    }
    loop {
        if !core.slot_is_live(monitor_id, &slot).await {
            break;
        }
        let viewers = slot.viewer_list();
        if viewers.is_empty() {
            sleep(Duration::from_millis(500)).await;
            continue;
        }
        match slot.engine.audio_payload().await {
            Ok(Some(payload)) => {
                for viewer in &viewers {
                    let _ = timeout(
                        crate::session::SEND_TIMEOUT,
                        viewer.send_binary(payload.bytes()),
                    )
                    .await;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("audio capture failed on monitor {monitor_id}: {e:#}"),
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Polls the host clipboard once a second and pushes changed text to all
/// viewers.
async fn clipboard_loop(core: Arc<ServerCore>) {
    let Some(clipboard) = core.clipboard.clone() else {
        return;
    };
    let mut last = String::new();
    loop {
        sleep(Duration::from_secs(1)).await;
        let Some(text) = clipboard.read_text() else {
            continue;
        };
        if text == last {
            continue;
        }
        last = text.clone();
        let Ok(json) = serde_json::to_string(&ServerText::Clipboard { text }) else {
            continue;
        };
        let viewers: Vec<Arc<Viewer>> = {
            let registry = core.registry.lock().await;
            registry
                .slots
                .values()
                .flat_map(|slot| slot.viewer_list())
                .collect()
        };
        for viewer in viewers {
            let json = json.clone();
            tokio::spawn(async move {
                let _ = viewer.send_text(json).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_payload, Decoded, VideoFrame, KEYFRAME};
    use async_trait::async_trait;
    use futures_util::Sink;
    use mirror_platform::source::{Frame, FrameSource, MonitorInfo, PixelFormat};
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context as TaskContext, Poll};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Error as WsError;

    /// Produces a slightly different 64x48 frame on every grab.
    struct TestSource {
        tier: SourceTier,
        counter: u32,
    }

    #[async_trait]
    impl FrameSource for TestSource {
        async fn next_frame(&mut self) -> Result<Frame> {
            self.counter = self.counter.wrapping_add(1);
            let fill = (self.counter % 250) as u8;
            Ok(Frame::tight(64, 48, PixelFormat::Rgb, vec![fill; 64 * 48 * 3]))
        }

        fn set_target_fps(&mut self, _fps: u32) {}

        fn identity(&self) -> &str {
            match self.tier {
                SourceTier::Native => "test (native)",
                SourceTier::Portable => "test (portable)",
            }
        }

        fn tier(&self) -> SourceTier {
            self.tier
        }

        async fn close(&mut self) {}
    }

    struct TestProvider {
        /// Tier the constructed source reports when native was requested.
        native_answer: SourceTier,
        fail_native: bool,
        fail_always: bool,
        last_prefer_native: Mutex<Option<bool>>,
        opens: AtomicUsize,
    }

    impl TestProvider {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                native_answer: SourceTier::Native,
                fail_native: false,
                fail_always: false,
                last_prefer_native: Mutex::new(None),
                opens: AtomicUsize::new(0),
            })
        }

        /// Silently answers native requests with a portable source.
        fn downgrading() -> Arc<Self> {
            Arc::new(Self {
                native_answer: SourceTier::Portable,
                ..Self::healthy_inner()
            })
        }

        fn failing_native() -> Arc<Self> {
            Arc::new(Self {
                fail_native: true,
                ..Self::healthy_inner()
            })
        }

        fn failing_always() -> Arc<Self> {
            Arc::new(Self {
                fail_always: true,
                ..Self::healthy_inner()
            })
        }

        fn healthy_inner() -> Self {
            Self {
                native_answer: SourceTier::Native,
                fail_native: false,
                fail_always: false,
                last_prefer_native: Mutex::new(None),
                opens: AtomicUsize::new(0),
            }
        }

        fn last_prefer_native(&self) -> Option<bool> {
            *self.last_prefer_native.lock().unwrap()
        }
    }

    impl SourceProvider for TestProvider {
        fn open(&self, _opts: &SourceOptions, prefer_native: bool) -> Result<Box<dyn FrameSource>> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            *self.last_prefer_native.lock().unwrap() = Some(prefer_native);
            if self.fail_always || (self.fail_native && prefer_native) {
                bail!("test capture init failure");
            }
            let tier = if prefer_native {
                self.native_answer
            } else {
                SourceTier::Portable
            };
            Ok(Box::new(TestSource { tier, counter: 0 }))
        }

        fn monitors(&self) -> Vec<MonitorInfo> {
            vec![
                MonitorInfo { id: 0, width: 1920, height: 1080 },
                MonitorInfo { id: 1, width: 1280, height: 720 },
            ]
        }
    }

    fn test_core(provider: Arc<TestProvider>) -> (Arc<ServerCore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("runtime_state.json");
        let core = ServerCore::new(
            ServerConfig::default(),
            provider,
            Collaborators::default(),
            state_path,
        );
        (core, dir)
    }

    struct RecordingSink(Arc<Mutex<Vec<WsMessage>>>);

    impl Sink<WsMessage> for RecordingSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: WsMessage) -> Result<(), WsError> {
            self.0.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    fn recording_viewer(id: u64) -> (Arc<Viewer>, Arc<Mutex<Vec<WsMessage>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let viewer = Viewer::new(
            id,
            "127.0.0.1:1".parse().unwrap(),
            Box::new(RecordingSink(log.clone())),
        );
        (viewer, log)
    }

    fn texts(log: &Arc<Mutex<Vec<WsMessage>>>) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                WsMessage::Text(t) => Some(t.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_registry_returns_existing_slot() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let a = core.get_or_create_engine(0, false).await.unwrap();
        let b = core.get_or_create_engine(0, false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(core.engines().await, vec![0]);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_driver_downgrade_is_blacklisted() {
        let provider = TestProvider::downgrading();
        let (core, _dir) = test_core(provider.clone());
        let slot = core.get_or_create_engine(0, false).await.unwrap();

        // The engine still runs, just on the portable tier.
        assert_eq!(slot.engine.tier(), SourceTier::Portable);
        assert_eq!(core.engines().await, vec![0]);

        let until = core.blacklist_until(0).await.expect("monitor 0 blacklisted");
        let remaining = until.saturating_duration_since(Instant::now());
        assert!(remaining > Duration::from_secs(55));
        assert!(remaining <= BLACKLIST_COOLDOWN);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_blacklisted_monitor_is_rebuilt_portable() {
        let provider = TestProvider::downgrading();
        let (core, _dir) = test_core(provider.clone());
        let first = core.get_or_create_engine(0, false).await.unwrap();
        assert_eq!(provider.last_prefer_native(), Some(true));

        // During the cool-down a fresh request must not touch the native path.
        let second = core.get_or_create_engine(0, false).await.unwrap();
        assert_eq!(provider.last_prefer_native(), Some(false));
        assert!(!Arc::ptr_eq(&first, &second));
        core.stop().await;
    }

    #[tokio::test]
    async fn test_construction_failure_retries_portable_once() {
        let provider = TestProvider::failing_native();
        let (core, _dir) = test_core(provider.clone());
        let slot = core.get_or_create_engine(0, false).await.unwrap();
        assert_eq!(slot.engine.tier(), SourceTier::Portable);
        assert!(core.blacklist_until(0).await.is_some());
        assert_eq!(provider.opens.load(Ordering::Relaxed), 2);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_poisoned_construction_propagates() {
        let provider = TestProvider::failing_always();
        let (core, _dir) = test_core(provider.clone());
        assert!(core.get_or_create_engine(0, false).await.is_err());
        // The server itself keeps running with an empty registry.
        assert!(core.engines().await.is_empty());
        assert!(core.blacklist_until(0).await.is_some());
    }

    #[tokio::test]
    async fn test_switch_monitor_rehomes_viewers() {
        let (core, dir) = test_core(TestProvider::healthy());
        let slot0 = core.get_or_create_engine(0, false).await.unwrap();

        let (v1, log1) = recording_viewer(101);
        let (v2, _log2) = recording_viewer(102);
        slot0.admit(v1.clone());
        slot0.admit(v2.clone());

        core.switch_monitor(1).await.unwrap();

        assert_eq!(core.engines().await, vec![1]);
        assert_eq!(core.current_monitor(), 1);
        let slot1 = core.slot(1).await.unwrap();
        assert!(slot1.contains_viewer(101));
        assert!(slot1.contains_viewer(102));
        assert_eq!(v1.monitor_id(), 1);

        let version_sent = texts(&log1)
            .iter()
            .any(|t| t.contains("\"VERSION\"") && t.contains("\"monitor_id\":1"));
        assert!(version_sent, "viewer did not receive the new VERSION record");

        let raw = std::fs::read_to_string(dir.path().join("runtime_state.json")).unwrap();
        assert_eq!(raw, r#"{"last_monitor_id":1}"#);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_software_reset_purges_everything() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let slot0 = core.get_or_create_engine(0, false).await.unwrap();
        let _slot1 = core.get_or_create_engine(1, false).await.unwrap();

        let (v1, log1) = recording_viewer(11);
        slot0.admit(v1.clone());
        let (dash, dash_log) = recording_viewer(99);
        core.dashboards.lock().unwrap().insert(99, dash.clone());

        core.registry
            .lock()
            .await
            .blacklist
            .insert(1, Instant::now() + BLACKLIST_COOLDOWN);
        assert!(core.in_flight.claim(11));

        core.software_reset().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Exactly one engine, for the remembered monitor; nothing pending.
        assert_eq!(core.engines().await, vec![core.current_monitor()]);
        assert_eq!(core.blacklist_len().await, 0);
        assert_eq!(core.in_flight_count(), 0);

        // The viewer channel was hard-closed with 1001.
        let closed = log1.lock().unwrap().iter().any(|m| {
            matches!(m, WsMessage::Close(Some(frame)) if frame.code == CloseCode::Away)
        });
        assert!(closed, "viewer was not closed with going-away");

        // Dashboard saw the reset begin and the recovery complete.
        let events = texts(&dash_log);
        let begin = events
            .iter()
            .position(|t| t.contains("SOFTWARE RESET INITIATED") && t.contains("\"error\""));
        let recovered = events
            .iter()
            .position(|t| t.contains("SYSTEM RECOVERED") && t.contains("\"info\""));
        assert!(begin.is_some(), "missing reset event: {events:?}");
        assert!(recovered.is_some(), "missing recovery event: {events:?}");
        assert!(begin < recovered);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_fan_out_drops_payload_for_busy_viewer() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let (busy, busy_log) = recording_viewer(1);
        let (idle, idle_log) = recording_viewer(2);

        assert!(core.in_flight.claim(1));
        let payload = protocol::frame_audio(b"x");
        core.fan_out(&[busy.clone(), idle.clone()], &payload);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(busy_log.lock().unwrap().is_empty());
        assert_eq!(idle_log.lock().unwrap().len(), 1);
        assert!(core.in_flight.is_sending(1));
        assert!(!core.in_flight.is_sending(2));
    }

    #[tokio::test]
    async fn test_force_refresh_marks_all_engines() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let slot = core.get_or_create_engine(0, false).await.unwrap();
        slot.force_keyframe.store(false, Ordering::SeqCst);

        let (viewer, _log) = recording_viewer(5);
        core.clone()
            .handle_text(&viewer, r#"{"type":"DASHBOARD_CMD","command":"FORCE_REFRESH"}"#)
            .await;
        assert!(slot.force_keyframe.load(Ordering::SeqCst));
        core.stop().await;
    }

    #[tokio::test]
    async fn test_client_stats_drive_governor_into_engine() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let slot = core.get_or_create_engine(0, false).await.unwrap();
        let (viewer, _log) = recording_viewer(6);
        slot.admit(viewer.clone());
        viewer.set_monitor_id(0);

        let heavy = r#"{"type":"CLIENT_STATS","pending_tiles":80,"avg_decode_ms":30.0,"backpressure":"heavy","device_name":"Tablet"}"#;
        core.clone().handle_text(&viewer, heavy).await;

        assert_eq!(viewer.device_name(), "Tablet");
        let params = slot.engine.params();
        assert_eq!(params.tile_size, 512);
        assert_eq!(params.quality, 50);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_dashboard_ident_moves_session_out_of_engine() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let slot = core.get_or_create_engine(0, false).await.unwrap();
        let (viewer, _log) = recording_viewer(7);
        slot.admit(viewer.clone());

        core.clone()
            .handle_text(&viewer, r#"{"type":"DASHBOARD_IDENT"}"#)
            .await;
        assert!(!slot.contains_viewer(7));
        assert_eq!(core.dashboard_count(), 1);
        core.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_viewer_text_is_ignored() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let (viewer, log) = recording_viewer(8);
        core.clone().handle_text(&viewer, "{broken json").await;
        core.clone()
            .handle_text(&viewer, r#"{"type":"UNKNOWN_THING"}"#)
            .await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cold_join_version_then_keyframe() {
        let (core, _dir) = test_core(TestProvider::healthy());
        let (listener, port) = ServerCore::bind_with_seek(0).await.unwrap();
        let server = tokio::spawn(core.clone().serve(listener, None, None));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let WsMessage::Text(text) = first else {
            panic!("expected VERSION text frame, got {first:?}");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_ref()).unwrap();
        assert_eq!(value["type"], "VERSION");
        assert_eq!(value["monitor_id"], 0);
        assert_eq!(value["tier"], "AIR");
        assert_eq!(value["language"], "zh_TW");

        let second = ws.next().await.unwrap().unwrap();
        let WsMessage::Binary(data) = second else {
            panic!("expected keyframe binary frame, got {second:?}");
        };
        assert_eq!(data[0], KEYFRAME);
        match decode_payload(&data).unwrap() {
            Decoded::Video {
                keyframe: true,
                frame: VideoFrame::Full { width, height, .. },
                ..
            } => assert_eq!((width, height), (64, 48)),
            other => panic!("unexpected payload: {other:?}"),
        }

        server.abort();
        core.stop().await;
    }

    #[tokio::test]
    async fn test_bind_seek_gives_up_after_three_ports() {
        let (holder0, base) = ServerCore::bind_with_seek(0).await.unwrap();
        let holder1 = TcpListener::bind(("0.0.0.0", base + 1)).await.unwrap();
        let holder2 = TcpListener::bind(("0.0.0.0", base + 2)).await.unwrap();

        assert!(ServerCore::bind_with_seek(base).await.is_err());

        drop(holder1);
        let (_listener, bound) = ServerCore::bind_with_seek(base).await.unwrap();
        assert_eq!(bound, base + 1);
        drop((holder0, holder2));
    }
}
