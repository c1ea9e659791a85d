//! Portable CPU capture backend built on `scrap`.
//!
//! `scrap`'s capturer is not `Send`, so a dedicated grab thread owns it and
//! hands frames over a bounded channel. The channel capacity of one means the
//! thread self-paces to however fast the engine actually consumes.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mirror_platform::source::{Frame, FrameSource, PixelFormat, SourceOptions, SourceTier};
use tokio::sync::mpsc;

use crate::scale;

const IDENTITY: &str = "scrap (portable CPU)";

pub struct ScrapSource {
    width: u32,
    height: u32,
    frames: mpsc::Receiver<Frame>,
    fps: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
    grab_thread: Option<thread::JoinHandle<()>>,
    closed: bool,
}

impl ScrapSource {
    pub fn open(opts: &SourceOptions) -> Result<Self> {
        let (init_tx, init_rx) = std_mpsc::channel::<Result<(u32, u32), String>>();
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(1);
        let fps = Arc::new(AtomicU32::new(opts.target_fps.clamp(1, 120)));
        let stop = Arc::new(AtomicBool::new(false));
        let fault = Arc::new(Mutex::new(None));

        let ctx = GrabContext {
            monitor_id: opts.monitor_id,
            resolution: opts.resolution,
            fps: fps.clone(),
            stop: stop.clone(),
            fault: fault.clone(),
        };
        let grab_thread = thread::Builder::new()
            .name("scrap-grab".into())
            .spawn(move || grab_loop(ctx, init_tx, frame_tx))
            .context("failed to spawn capture thread")?;

        let (width, height) = init_rx
            .recv_timeout(Duration::from_secs(5))
            .context("capture thread did not report dimensions")?
            .map_err(|e| anyhow::anyhow!(e))?;

        tracing::info!("portable capture ready: monitor {} at {}x{}", opts.monitor_id, width, height);

        let (width, height) = match opts.resolution {
            Some(target) => target,
            None => (width, height),
        };

        Ok(Self {
            width,
            height,
            frames: frame_rx,
            fps,
            stop,
            fault,
            grab_thread: Some(grab_thread),
            closed: false,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fault_message(&self) -> String {
        self.fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "capture thread exited".to_string())
    }
}

#[async_trait]
impl FrameSource for ScrapSource {
    async fn next_frame(&mut self) -> Result<Frame> {
        if self.closed {
            bail!("capture source is closed");
        }
        match self.frames.recv().await {
            Some(frame) => Ok(frame),
            None => bail!("portable capture failed: {}", self.fault_message()),
        }
    }

    fn set_target_fps(&mut self, fps: u32) {
        self.fps.store(fps.clamp(1, 120), Ordering::Relaxed);
    }

    fn identity(&self) -> &str {
        IDENTITY
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Portable
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.store(true, Ordering::Relaxed);
        self.frames.close();
        if let Some(handle) = self.grab_thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl Drop for ScrapSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct GrabContext {
    monitor_id: u32,
    resolution: Option<(u32, u32)>,
    fps: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
}

fn grab_loop(
    ctx: GrabContext,
    init_tx: std_mpsc::Sender<Result<(u32, u32), String>>,
    frames: mpsc::Sender<Frame>,
) {
    let mut displays = match scrap::Display::all() {
        Ok(d) => d,
        Err(e) => {
            let _ = init_tx.send(Err(format!("display enumeration failed: {e}")));
            return;
        }
    };
    if ctx.monitor_id as usize >= displays.len() {
        let _ = init_tx.send(Err(format!(
            "monitor {} not found ({} displays)",
            ctx.monitor_id,
            displays.len()
        )));
        return;
    }
    let display = displays.remove(ctx.monitor_id as usize);
    let (width, height) = (display.width() as u32, display.height() as u32);
    let mut capturer = match scrap::Capturer::new(display) {
        Ok(c) => c,
        Err(e) => {
            let _ = init_tx.send(Err(format!("capturer init failed: {e}")));
            return;
        }
    };
    let _ = init_tx.send(Ok((width, height)));

    let mut failures = 0u32;
    let mut last_grab = Instant::now() - Duration::from_secs(1);

    while !ctx.stop.load(Ordering::Relaxed) {
        let interval = Duration::from_secs_f64(1.0 / ctx.fps.load(Ordering::Relaxed).max(1) as f64);
        if let Some(wait) = interval.checked_sub(last_grab.elapsed()) {
            thread::sleep(wait);
        }

        match capturer.frame() {
            Ok(buf) => {
                failures = 0;
                last_grab = Instant::now();
                let stride = buf.len() / height as usize;
                let mut tight = Vec::with_capacity(width as usize * height as usize * 4);
                for y in 0..height as usize {
                    let start = y * stride;
                    tight.extend_from_slice(&buf[start..start + width as usize * 4]);
                }
                let mut frame = Frame::tight(width, height, PixelFormat::Bgra, tight);
                if let Some((tw, th)) = ctx.resolution {
                    frame = scale::resize_frame(frame, tw, th);
                }
                // Waits while the previous frame is still unconsumed; errors
                // only when the receiver is gone.
                if frames.blocking_send(frame).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                failures += 1;
                if failures > 3 {
                    tracing::warn!("portable capture giving up: {e}");
                    *ctx.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                    break;
                }
                // Locked workstation and similar transient faults clear on
                // their own; back off and retry.
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
