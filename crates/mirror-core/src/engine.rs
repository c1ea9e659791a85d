//! Per-monitor streaming engine: binds capture, delta detection, encoding
//! and framing behind a single-flight lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_platform::audio::AudioSource;
use mirror_platform::source::{Frame, FrameSource, SourceTier};
use tokio::time::timeout;

use crate::delta::DeltaDetector;
use crate::encode::TileEncoder;
use crate::protocol::{self, EncodedTile, Payload};

/// Governor-driven parameters, latched here and applied on the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineParams {
    pub quality: u8,
    pub tile_size: u32,
    pub fps: u32,
}

pub struct Engine {
    monitor_id: u32,
    identity: String,
    tier: SourceTier,
    has_audio: bool,
    params: Mutex<EngineParams>,
    inner: tokio::sync::Mutex<Inner>,
    encoder: TileEncoder,
    last_frame: Mutex<Option<Frame>>,
    stopped: AtomicBool,
}

struct Inner {
    source: Box<dyn FrameSource>,
    detector: DeltaDetector,
    audio: Option<Box<dyn AudioSource>>,
    applied_fps: u32,
}

impl Engine {
    pub fn new(
        monitor_id: u32,
        source: Box<dyn FrameSource>,
        audio: Option<Box<dyn AudioSource>>,
        params: EngineParams,
    ) -> Result<Self> {
        let identity = source.identity().to_string();
        let tier = source.tier();
        tracing::info!(
            "engine for monitor {monitor_id} using {identity} (q={}, tile={}, fps={})",
            params.quality,
            params.tile_size,
            params.fps
        );
        Ok(Self {
            monitor_id,
            identity,
            tier,
            has_audio: audio.is_some(),
            params: Mutex::new(params),
            inner: tokio::sync::Mutex::new(Inner {
                source,
                detector: DeltaDetector::new(params.tile_size),
                audio,
                applied_fps: params.fps,
            }),
            encoder: TileEncoder::new()?,
            last_frame: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn monitor_id(&self) -> u32 {
        self.monitor_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn tier(&self) -> SourceTier {
        self.tier
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio
    }

    pub fn params(&self) -> EngineParams {
        *self.params.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_quality(&self, quality: u8) {
        self.params.lock().unwrap_or_else(|e| e.into_inner()).quality = quality.clamp(1, 100);
    }

    pub fn set_tile_size(&self, tile_size: u32) {
        self.params.lock().unwrap_or_else(|e| e.into_inner()).tile_size = tile_size;
    }

    pub fn set_fps(&self, fps: u32) {
        self.params.lock().unwrap_or_else(|e| e.into_inner()).fps = fps.clamp(1, 120);
    }

    /// Captures, diffs and encodes the next frame. `None` means nothing
    /// changed. The held frame for snapshots is refreshed on every call.
    pub async fn next_payload(&self) -> Result<Option<Payload>> {
        self.produce(false).await
    }

    /// Forces a full-frame delta and re-tags it as a keyframe (0x02).
    pub async fn keyframe_payload(&self) -> Result<Payload> {
        self.produce(true)
            .await?
            .map(Payload::into_keyframe)
            .context("keyframe produced no payload")
    }

    async fn produce(&self, force_full: bool) -> Result<Option<Payload>> {
        let mut inner = self.inner.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let params = self.params();

        // Fused backends hand back complete wire payloads directly.
        if let Some(fused) = inner.source.fused() {
            let bytes = fused.capture_delta_payload(params.tile_size, params.quality, force_full)?;
            return Ok(bytes.map(Payload::from_bytes));
        }

        if params.fps != inner.applied_fps {
            inner.source.set_target_fps(params.fps);
            inner.applied_fps = params.fps;
        }

        let frame = inner.source.next_frame().await?;
        *self.last_frame.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame.clone());

        inner.detector.set_tile_size(params.tile_size);
        let delta = if force_full {
            inner.detector.full_frame(&frame)
        } else {
            inner.detector.detect(&frame)
        };
        if delta.is_empty() {
            return Ok(None);
        }

        let full = delta.full_frame_fallback;
        let encoder = self.encoder.clone();
        let quality = params.quality;
        let encoded: Vec<EncodedTile> =
            tokio::task::spawn_blocking(move || encoder.encode_delta(&delta, quality))
                .await
                .context("encode worker failed")?;
        if encoded.is_empty() {
            return Ok(None);
        }

        Ok(Some(protocol::frame_delta(
            protocol::now_ms(),
            &encoded,
            full,
        )?))
    }

    /// The held frame, or a short bounded capture retry when cold.
    pub async fn snapshot(&self) -> Option<Frame> {
        if let Some(frame) = self.held_frame() {
            return Some(frame);
        }
        for _ in 0..3 {
            let _ = timeout(Duration::from_secs(2), self.next_payload()).await;
            if let Some(frame) = self.held_frame() {
                return Some(frame);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        None
    }

    fn held_frame(&self) -> Option<Frame> {
        self.last_frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Next audio packet wrapped in the 0x05 envelope.
    pub async fn audio_payload(&self) -> Result<Option<Payload>> {
        let mut inner = self.inner.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(audio) = inner.audio.as_mut() else {
            return Ok(None);
        };
        Ok(audio.next_packet()?.map(|p| protocol::frame_audio(&p)))
    }

    /// Idempotent; waits out any in-flight pipeline step, then releases the
    /// capture backend.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if !self.stopped.swap(true, Ordering::SeqCst) {
            inner.source.close().await;
            tracing::info!("engine for monitor {} stopped", self.monitor_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_payload, Decoded, VideoFrame, DELTA, KEYFRAME};
    use async_trait::async_trait;
    use mirror_platform::source::PixelFormat;

    /// Replays a fixed frame sequence, repeating the last one.
    struct ScriptSource {
        frames: Vec<Frame>,
        index: usize,
        closed: bool,
    }

    impl ScriptSource {
        fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames,
                index: 0,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl FrameSource for ScriptSource {
        async fn next_frame(&mut self) -> Result<Frame> {
            let frame = self.frames[self.index.min(self.frames.len() - 1)].clone();
            self.index += 1;
            Ok(frame)
        }

        fn set_target_fps(&mut self, _fps: u32) {}

        fn identity(&self) -> &str {
            "script"
        }

        fn tier(&self) -> SourceTier {
            SourceTier::Portable
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn rgb(w: u32, h: u32, fill: u8) -> Frame {
        Frame::tight(w, h, PixelFormat::Rgb, vec![fill; (w * h * 3) as usize])
    }

    fn params() -> EngineParams {
        EngineParams {
            quality: 70,
            tile_size: 32,
            fps: 30,
        }
    }

    fn engine_with(frames: Vec<Frame>) -> Engine {
        Engine::new(0, Box::new(ScriptSource::new(frames)), None, params()).unwrap()
    }

    #[tokio::test]
    async fn test_first_payload_is_full_frame_delta() {
        let engine = engine_with(vec![rgb(64, 48, 10)]);
        let payload = engine.next_payload().await.unwrap().unwrap();
        assert_eq!(payload.type_tag(), DELTA);
        match decode_payload(&payload.bytes()).unwrap() {
            Decoded::Video {
                frame: VideoFrame::Full { width, height, .. },
                ..
            } => assert_eq!((width, height), (64, 48)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_static_screen_yields_none_but_updates_held_frame() {
        let engine = engine_with(vec![rgb(32, 32, 5)]);
        assert!(engine.next_payload().await.unwrap().is_some());
        assert!(engine.next_payload().await.unwrap().is_none());
        assert!(engine.snapshot().await.is_some());
    }

    #[tokio::test]
    async fn test_keyframe_is_retagged_and_idempotent() {
        let engine = engine_with(vec![rgb(32, 32, 5)]);
        let k1 = engine.keyframe_payload().await.unwrap();
        let k2 = engine.keyframe_payload().await.unwrap();
        assert_eq!(k1.type_tag(), KEYFRAME);
        assert_eq!(k2.type_tag(), KEYFRAME);
        let dims = |p: &Payload| match decode_payload(&p.bytes()).unwrap() {
            Decoded::Video {
                keyframe: true,
                frame: VideoFrame::Full { width, height, .. },
                ..
            } => (width, height),
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(dims(&k1), dims(&k2));
    }

    #[tokio::test]
    async fn test_timestamps_are_monotone() {
        let engine = engine_with(vec![rgb(16, 16, 1), rgb(16, 16, 2), rgb(16, 16, 3)]);
        let p1 = engine.next_payload().await.unwrap().unwrap();
        let p2 = engine.next_payload().await.unwrap().unwrap();
        assert!(p2.timestamp_ms() >= p1.timestamp_ms());
    }

    #[tokio::test]
    async fn test_tile_size_applies_on_next_frame() {
        let mut second = rgb(64, 64, 0);
        {
            let mut data = second.data.to_vec();
            data[0] = 255;
            second = Frame::tight(64, 64, PixelFormat::Rgb, data);
        }
        let engine = engine_with(vec![rgb(64, 64, 0), second]);
        engine.next_payload().await.unwrap();
        engine.set_tile_size(16);
        let payload = engine.next_payload().await.unwrap().unwrap();
        match decode_payload(&payload.bytes()).unwrap() {
            Decoded::Video {
                frame: VideoFrame::Tiles(tiles),
                ..
            } => {
                assert_eq!(tiles.len(), 1);
                assert_eq!((tiles[0].w, tiles[0].h), (16, 16));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_silences_output() {
        let engine = engine_with(vec![rgb(8, 8, 1)]);
        engine.stop().await;
        engine.stop().await;
        assert!(engine.next_payload().await.unwrap().is_none());
        assert!(engine.keyframe_payload().await.is_err());
    }

    struct OneShotAudio {
        sent: bool,
    }

    impl AudioSource for OneShotAudio {
        fn next_packet(&mut self) -> Result<Option<Vec<u8>>> {
            if self.sent {
                Ok(None)
            } else {
                self.sent = true;
                Ok(Some(vec![1, 2, 3]))
            }
        }
    }

    #[tokio::test]
    async fn test_audio_envelope_passthrough() {
        let engine = Engine::new(
            0,
            Box::new(ScriptSource::new(vec![rgb(8, 8, 0)])),
            Some(Box::new(OneShotAudio { sent: false })),
            params(),
        )
        .unwrap();
        assert!(engine.has_audio());
        let payload = engine.audio_payload().await.unwrap().unwrap();
        assert_eq!(payload.type_tag(), crate::protocol::AUDIO);
        assert!(engine.audio_payload().await.unwrap().is_none());
    }
}
