//! Dashboard data surface: the narrow interface the external HTTP layer
//! calls for `/api/stats` and `/api/snapshot`. Snapshot production never
//! fails; anything that goes wrong yields the "no signal" placeholder.

use image::imageops::{self, FilterType};
use image::RgbImage;
use mirror_platform::host::HostStats;
use mirror_platform::source::{Frame, MonitorInfo, PixelFormat};
use serde::Serialize;

use crate::server::ServerCore;

/// Snapshots fit within 480x270, aspect preserved.
pub const SNAPSHOT_MAX: (u32, u32) = (480, 270);
const SNAPSHOT_QUALITY: i32 = 40;
const PLACEHOLDER_RGB: [u8; 3] = [0x0f, 0x17, 0x2a];

#[derive(Debug, Clone, Serialize)]
pub struct ClientDetail {
    pub id: String,
    pub name: String,
    pub fps: f32,
    pub battery: u32,
    pub is_charging: bool,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub clients: usize,
    pub client_details: Vec<ClientDetail>,
    pub monitors: Vec<MonitorInfo>,
    pub host: HostStats,
}

impl ServerCore {
    pub async fn stats_report(&self) -> StatsReport {
        let mut client_details = Vec::new();
        for monitor in self.engines().await {
            let Some(slot) = self.slot(monitor).await else {
                continue;
            };
            let telemetry = slot
                .governor
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .telemetry()
                .clone();
            for viewer in slot.viewer_list() {
                client_details.push(ClientDetail {
                    id: viewer.addr.to_string(),
                    name: viewer.device_name(),
                    fps: telemetry.fps,
                    battery: telemetry.battery,
                    is_charging: telemetry.is_charging,
                    mode: telemetry.mode.clone(),
                });
            }
        }
        StatsReport {
            clients: client_details.len(),
            client_details,
            monitors: self.provider().monitors(),
            host: self.host().sample(),
        }
    }

    /// JPEG snapshot of a monitor's held frame, at most 480x270.
    pub async fn snapshot_jpeg(&self, monitor_id: u32) -> Vec<u8> {
        if let Some(slot) = self.slot(monitor_id).await {
            if let Some(frame) = slot.engine.snapshot().await {
                if let Some(jpeg) = frame_to_jpeg(&frame) {
                    return jpeg;
                }
            }
        }
        placeholder_jpeg()
    }
}

fn frame_to_jpeg(frame: &Frame) -> Option<Vec<u8>> {
    let rgb = frame_rgb(frame);
    let img = RgbImage::from_raw(frame.width, frame.height, rgb)?;
    let (tw, th) = fit_within((frame.width, frame.height), SNAPSHOT_MAX);
    let img = if (tw, th) == (frame.width, frame.height) {
        img
    } else {
        imageops::resize(&img, tw, th, FilterType::Triangle)
    };
    jpeg_from_rgb(img.as_raw(), tw, th)
}

/// Packs the frame's rows into RGB, swizzling BGRA input.
fn frame_rgb(frame: &Frame) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((frame.width * frame.height * 3) as usize);
    for y in 0..frame.height {
        let row = frame.row(y);
        match frame.format {
            PixelFormat::Rgb => rgb.extend_from_slice(row),
            PixelFormat::Bgra => {
                for px in row.chunks_exact(4) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
    }
    rgb
}

/// Scales dimensions down to fit in a bounding box, never up.
fn fit_within((w, h): (u32, u32), (max_w, max_h): (u32, u32)) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = (f64::from(max_w) / f64::from(w)).min(f64::from(max_h) / f64::from(h));
    let tw = ((f64::from(w) * scale) as u32).max(1);
    let th = ((f64::from(h) * scale) as u32).max(1);
    (tw, th)
}

fn jpeg_from_rgb(rgb: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let mut compressor = turbojpeg::Compressor::new().ok()?;
    let _ = compressor.set_quality(SNAPSHOT_QUALITY);
    let image = turbojpeg::Image {
        pixels: rgb,
        width: width as usize,
        pitch: (width * 3) as usize,
        height: height as usize,
        format: turbojpeg::PixelFormat::RGB,
    };
    compressor.compress_to_vec(image).ok()
}

fn placeholder_jpeg() -> Vec<u8> {
    let img = RgbImage::from_pixel(SNAPSHOT_MAX.0, SNAPSHOT_MAX.1, image::Rgb(PLACEHOLDER_RGB));
    jpeg_from_rgb(img.as_raw(), SNAPSHOT_MAX.0, SNAPSHOT_MAX.1).unwrap_or_else(|| {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 40);
        let _ = encoder.encode(
            img.as_raw(),
            SNAPSHOT_MAX.0,
            SNAPSHOT_MAX.1,
            image::ExtendedColorType::Rgb8,
        );
        out
    })
}
