//! Tile partitioning and change detection against the previous frame.

use mirror_platform::source::{Frame, PixelFormat};

/// A changed screen region with its pixels extracted as RGB.
#[derive(Debug, Clone)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub pixels: Vec<u8>,
}

/// The set of tiles that changed since the previous frame. When
/// `full_frame_fallback` is set there is exactly one tile covering the whole
/// frame.
#[derive(Debug, Clone)]
pub struct DeltaFrame {
    pub frame_number: u64,
    pub tiles: Vec<Tile>,
    pub full_frame_fallback: bool,
}

impl DeltaFrame {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty() && !self.full_frame_fallback
    }
}

/// Compares frames tile-by-tile. Holds the previous frame as the reference;
/// the reference is always replaced with the latest frame, even when nothing
/// changed, so the next comparison is against what viewers last saw.
pub struct DeltaDetector {
    tile_size: u32,
    reference: Option<Frame>,
    frame_number: u64,
}

impl DeltaDetector {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size.max(8),
            reference: None,
            frame_number: 0,
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Grid size may change between frames; comparison stays valid because
    /// the reference is the raw previous frame, not its tiling.
    pub fn set_tile_size(&mut self, tile_size: u32) {
        let clamped = tile_size.max(8);
        if clamped != self.tile_size {
            tracing::debug!("tile size updated to {clamped}");
            self.tile_size = clamped;
        }
    }

    pub fn reset(&mut self) {
        self.reference = None;
    }

    /// Detects changed tiles. First frame, resolution or format changes all
    /// force the full-frame fallback.
    pub fn detect(&mut self, frame: &Frame) -> DeltaFrame {
        self.frame_number += 1;

        let needs_full = match &self.reference {
            Some(prev) => !prev.same_shape(frame),
            None => true,
        };
        if needs_full {
            self.reference = Some(frame.clone());
            return DeltaFrame {
                frame_number: self.frame_number,
                tiles: vec![whole_frame_tile(frame)],
                full_frame_fallback: true,
            };
        }

        let prev = self.reference.as_ref().unwrap_or(frame);
        let mut tiles = Vec::new();
        let mut y = 0;
        while y < frame.height {
            let h = self.tile_size.min(frame.height - y);
            let mut x = 0;
            while x < frame.width {
                let w = self.tile_size.min(frame.width - x);
                if region_changed(prev, frame, x, y, w, h) {
                    tiles.push(extract_tile(frame, x, y, w, h));
                }
                x += self.tile_size;
            }
            y += self.tile_size;
        }

        self.reference = Some(frame.clone());
        DeltaFrame {
            frame_number: self.frame_number,
            tiles,
            full_frame_fallback: false,
        }
    }

    /// Explicit full-frame delta for keyframes. Also replaces the reference
    /// so subsequent deltas stay correct.
    pub fn full_frame(&mut self, frame: &Frame) -> DeltaFrame {
        self.frame_number += 1;
        self.reference = Some(frame.clone());
        DeltaFrame {
            frame_number: self.frame_number,
            tiles: vec![whole_frame_tile(frame)],
            full_frame_fallback: true,
        }
    }
}

fn whole_frame_tile(frame: &Frame) -> Tile {
    extract_tile(frame, 0, 0, frame.width, frame.height)
}

fn region_changed(a: &Frame, b: &Frame, x: u32, y: u32, w: u32, h: u32) -> bool {
    let bpp = a.format.bytes_per_pixel();
    let x0 = x as usize * bpp;
    let len = w as usize * bpp;
    for row in 0..h {
        let ay = ((y + row) * a.stride) as usize + x0;
        let by = ((y + row) * b.stride) as usize + x0;
        if a.data[ay..ay + len] != b.data[by..by + len] {
            return true;
        }
    }
    false
}

/// Copies a region out of the frame as packed RGB, swizzling BGRA input.
fn extract_tile(frame: &Frame, x: u32, y: u32, w: u32, h: u32) -> Tile {
    let bpp = frame.format.bytes_per_pixel();
    let mut pixels = Vec::with_capacity((w * h * 3) as usize);
    for row in 0..h {
        let start = ((y + row) * frame.stride) as usize + x as usize * bpp;
        let src = &frame.data[start..start + w as usize * bpp];
        match frame.format {
            PixelFormat::Rgb => pixels.extend_from_slice(src),
            PixelFormat::Bgra => {
                for px in src.chunks_exact(4) {
                    pixels.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
    }
    Tile { x, y, w, h, pixels }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_platform::source::{Frame, PixelFormat};

    fn rgb_frame(w: u32, h: u32, fill: u8) -> Frame {
        Frame::tight(w, h, PixelFormat::Rgb, vec![fill; (w * h * 3) as usize])
    }

    fn set_pixel(frame: &Frame, x: u32, y: u32, value: u8) -> Frame {
        let mut data = frame.data.to_vec();
        let off = (y * frame.stride + x * 3) as usize;
        data[off] = value;
        Frame::tight(frame.width, frame.height, frame.format, data)
    }

    #[test]
    fn test_first_frame_is_full_fallback() {
        let mut detector = DeltaDetector::new(32);
        let delta = detector.detect(&rgb_frame(64, 48, 10));
        assert!(delta.full_frame_fallback);
        assert_eq!(delta.tiles.len(), 1);
        let t = &delta.tiles[0];
        assert_eq!((t.x, t.y, t.w, t.h), (0, 0, 64, 48));
        assert_eq!(t.pixels.len(), 64 * 48 * 3);
    }

    #[test]
    fn test_unchanged_frame_yields_no_tiles() {
        let mut detector = DeltaDetector::new(32);
        let frame = rgb_frame(64, 64, 42);
        detector.detect(&frame);
        let delta = detector.detect(&frame);
        assert!(delta.is_empty());
    }

    #[test]
    fn test_single_pixel_change_emits_one_tile() {
        let mut detector = DeltaDetector::new(32);
        let frame = rgb_frame(64, 64, 0);
        detector.detect(&frame);
        let changed = set_pixel(&frame, 40, 10, 255);
        let delta = detector.detect(&changed);
        assert_eq!(delta.tiles.len(), 1);
        let t = &delta.tiles[0];
        assert_eq!((t.x, t.y, t.w, t.h), (32, 0, 32, 32));
    }

    #[test]
    fn test_edge_tiles_are_shortened() {
        let mut detector = DeltaDetector::new(32);
        // 50x40 leaves an 18-wide and 8-tall edge band.
        let frame = rgb_frame(50, 40, 1);
        detector.detect(&frame);
        let changed = set_pixel(&frame, 49, 39, 200);
        let delta = detector.detect(&changed);
        assert_eq!(delta.tiles.len(), 1);
        let t = &delta.tiles[0];
        assert_eq!((t.x, t.y, t.w, t.h), (32, 32, 18, 8));
        assert!(t.x + t.w <= 50 && t.y + t.h <= 40);
    }

    #[test]
    fn test_all_emitted_tiles_stay_in_bounds() {
        let mut detector = DeltaDetector::new(24);
        let frame = rgb_frame(100, 67, 3);
        detector.detect(&frame);
        let changed = rgb_frame(100, 67, 4);
        let delta = detector.detect(&changed);
        assert!(!delta.tiles.is_empty());
        for t in &delta.tiles {
            assert!(t.x + t.w <= 100);
            assert!(t.y + t.h <= 67);
            assert_eq!(t.pixels.len(), (t.w * t.h * 3) as usize);
        }
    }

    #[test]
    fn test_resolution_change_forces_full_frame() {
        let mut detector = DeltaDetector::new(32);
        detector.detect(&rgb_frame(64, 64, 5));
        let delta = detector.detect(&rgb_frame(32, 32, 5));
        assert!(delta.full_frame_fallback);
        assert_eq!(delta.tiles[0].w, 32);
    }

    #[test]
    fn test_tile_size_change_between_frames() {
        let mut detector = DeltaDetector::new(32);
        let frame = rgb_frame(64, 64, 0);
        detector.detect(&frame);
        detector.set_tile_size(16);
        let changed = set_pixel(&frame, 0, 0, 9);
        let delta = detector.detect(&changed);
        assert_eq!(delta.tiles.len(), 1);
        assert_eq!((delta.tiles[0].w, delta.tiles[0].h), (16, 16));
    }

    #[test]
    fn test_reference_replaced_even_without_changes() {
        let mut detector = DeltaDetector::new(32);
        let a = rgb_frame(64, 64, 1);
        let b = set_pixel(&a, 5, 5, 77);
        detector.detect(&a);
        detector.detect(&b);
        // b is now the reference, so an identical b yields nothing.
        assert!(detector.detect(&b).is_empty());
    }

    #[test]
    fn test_frame_numbers_increase() {
        let mut detector = DeltaDetector::new(32);
        let frame = rgb_frame(16, 16, 0);
        let first = detector.detect(&frame);
        let second = detector.detect(&frame);
        let key = detector.full_frame(&frame);
        assert!(first.frame_number < second.frame_number);
        assert!(second.frame_number < key.frame_number);
    }

    #[test]
    fn test_bgra_extraction_swizzles() {
        let mut detector = DeltaDetector::new(8);
        // Single blue pixel in BGRA.
        let frame = Frame::tight(1, 1, PixelFormat::Bgra, vec![255, 0, 0, 255]);
        let delta = detector.detect(&frame);
        assert_eq!(delta.tiles[0].pixels, vec![0, 0, 255]);
    }
}
