use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Bgra,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Bgra => 4,
        }
    }
}

/// A captured frame. `data` is reference-counted, so cloning a frame (e.g. to
/// keep it around for snapshots) does not copy pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row. May exceed `width * bytes_per_pixel` for padded buffers.
    pub stride: u32,
    pub data: Bytes,
}

impl Frame {
    /// Frame over a tightly packed buffer (stride == width * bpp).
    pub fn tight(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        let stride = width * format.bytes_per_pixel() as u32;
        Self {
            width,
            height,
            format,
            stride,
            data: Bytes::from(data),
        }
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.stride) as usize;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }

    pub fn same_shape(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }
}

/// How a backend acquires pixels. The registry treats a `Portable` source
/// handed back from a native-preferring request as a driver downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTier {
    Native,
    Portable,
}

/// Parameters a source is opened with. One immutable snapshot per engine;
/// only the frame rate can change afterwards.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub monitor_id: u32,
    pub target_fps: u32,
    /// Output resolution; `None` streams at the monitor's native size.
    pub resolution: Option<(u32, u32)>,
    pub draw_cursor: bool,
    /// Policy override for backends known to destabilize drivers. Forced off
    /// in the low-power tier before the provider ever sees it.
    pub allow_unstable_fallback: bool,
}

/// A running capture backend for one monitor.
///
/// Transient OS faults (locked workstation, access denied) are absorbed
/// inside `next_frame` with a >= 1 s backoff; only persistent faults surface
/// as errors, at which point the owner rebuilds on the portable tier.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame>;

    fn set_target_fps(&mut self, fps: u32);

    /// Stable backend name, e.g. `"x11-shm (native)"`.
    fn identity(&self) -> &str;

    fn tier(&self) -> SourceTier;

    /// Capability probe: backends that fuse capture, diff and encode into a
    /// single hop return their fused pipeline here and the engine bypasses
    /// the in-process partitioner and encoder.
    fn fused(&mut self) -> Option<&mut dyn FusedPipeline> {
        None
    }

    /// Release driver resources. Idempotent; called on every exit path.
    async fn close(&mut self);
}

/// Fused capture+diff+encode fast path. Produces complete wire payloads with
/// the same semantics as the in-process pipeline.
pub trait FusedPipeline: Send {
    /// `None` means no tile changed since the last call.
    fn capture_delta_payload(
        &mut self,
        tile_size: u32,
        quality: u8,
        force_full: bool,
    ) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
}

/// Opens capture backends and enumerates displays. The host implementation
/// probes the native tier first when preferred; callers inspect `tier()` on
/// the returned source to detect silent downgrades.
pub trait SourceProvider: Send + Sync {
    fn open(&self, opts: &SourceOptions, prefer_native: bool) -> Result<Box<dyn FrameSource>>;

    fn monitors(&self) -> Vec<MonitorInfo>;
}

/// Known driver-fault markers. Matching errors escaping an engine mean the
/// native path is broken and the monitor should be rebuilt portable.
pub fn is_driver_fault(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("access is denied")
        || m.contains("access denied")
        || m.contains("0x80070005")
        || m.contains("the parameter is incorrect")
}
