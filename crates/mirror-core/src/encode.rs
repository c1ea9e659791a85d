//! WebP tile encoding on a bounded worker pool.

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use std::sync::Arc;

use crate::delta::{DeltaFrame, Tile};
use crate::protocol::EncodedTile;

/// Encodes the tiles of one delta concurrently. Encoder state is immutable
/// between calls; quality is passed per delta so governor updates apply on
/// the next frame without reconfiguration.
#[derive(Clone)]
pub struct TileEncoder {
    pool: Arc<rayon::ThreadPool>,
    lossless: bool,
}

impl TileEncoder {
    pub fn new() -> Result<Self> {
        Self::build(false)
    }

    /// Lossless variant; not used on the streaming path.
    pub fn new_lossless() -> Result<Self> {
        Self::build(true)
    }

    fn build(lossless: bool) -> Result<Self> {
        let threads = (num_cpus::get() + 4).min(32);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tile-encode-{i}"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
            lossless,
        })
    }

    /// Output order follows the partitioner's scan order. Tiles the codec
    /// rejects are dropped from the delta.
    pub fn encode_delta(&self, delta: &DeltaFrame, quality: u8) -> Vec<EncodedTile> {
        let quality = f32::from(quality.clamp(1, 100));
        let encoded: Vec<Option<EncodedTile>> = if delta.tiles.len() > 1 {
            self.pool.install(|| {
                delta
                    .tiles
                    .par_iter()
                    .map(|t| self.encode_tile(t, quality))
                    .collect()
            })
        } else {
            delta
                .tiles
                .iter()
                .map(|t| self.encode_tile(t, quality))
                .collect()
        };
        encoded.into_iter().flatten().collect()
    }

    fn encode_tile(&self, tile: &Tile, quality: f32) -> Option<EncodedTile> {
        match encode_webp(&tile.pixels, tile.w, tile.h, quality, self.lossless) {
            Ok(data) => Some(EncodedTile {
                x: tile.x as i32,
                y: tile.y as i32,
                w: tile.w as i32,
                h: tile.h as i32,
                data,
            }),
            Err(e) => {
                tracing::debug!(
                    "dropping {}x{} tile at ({}, {}): {e}",
                    tile.w,
                    tile.h,
                    tile.x,
                    tile.y
                );
                None
            }
        }
    }
}

fn encode_webp(rgb: &[u8], w: u32, h: u32, quality: f32, lossless: bool) -> Result<Vec<u8>> {
    if rgb.len() != (w * h * 3) as usize {
        return Err(anyhow!("pixel buffer does not match {w}x{h}"));
    }
    let encoder = webp::Encoder::from_rgb(rgb, w, h);
    let memory = encoder
        .encode_simple(lossless, quality)
        .map_err(|e| anyhow!("webp encode failed: {e:?}"))?;
    Ok(memory.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_tile(x: u32, y: u32, w: u32, h: u32) -> Tile {
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for py in 0..h {
            for px in 0..w {
                pixels.extend_from_slice(&[(px * 4) as u8, (py * 4) as u8, ((px + py) * 2) as u8]);
            }
        }
        Tile { x, y, w, h, pixels }
    }

    fn delta_of(tiles: Vec<Tile>) -> DeltaFrame {
        DeltaFrame {
            frame_number: 1,
            tiles,
            full_frame_fallback: false,
        }
    }

    #[test]
    fn test_encoded_tile_is_decodable() {
        let encoder = TileEncoder::new().unwrap();
        let out = encoder.encode_delta(&delta_of(vec![gradient_tile(0, 0, 32, 24)]), 70);
        assert_eq!(out.len(), 1);
        let img = webp::Decoder::new(&out[0].data).decode().unwrap();
        assert_eq!((img.width(), img.height()), (32, 24));
    }

    #[test]
    fn test_scan_order_is_preserved() {
        let encoder = TileEncoder::new().unwrap();
        let tiles = vec![
            gradient_tile(0, 0, 16, 16),
            gradient_tile(16, 0, 16, 16),
            gradient_tile(0, 16, 16, 16),
            gradient_tile(16, 16, 16, 16),
        ];
        let out = encoder.encode_delta(&delta_of(tiles), 60);
        assert_eq!(out.len(), 4);
        let coords: Vec<(i32, i32)> = out.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(coords, vec![(0, 0), (16, 0), (0, 16), (16, 16)]);
    }

    #[test]
    fn test_bad_tile_is_dropped_not_fatal() {
        let encoder = TileEncoder::new().unwrap();
        let bad = Tile {
            x: 0,
            y: 0,
            w: 8,
            h: 8,
            pixels: vec![0; 5],
        };
        let out = encoder.encode_delta(&delta_of(vec![bad, gradient_tile(8, 0, 8, 8)]), 50);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].x, 8);
    }

    #[test]
    fn test_lossless_round_trips_exactly() {
        let encoder = TileEncoder::new_lossless().unwrap();
        let tile = gradient_tile(0, 0, 16, 16);
        let expected = tile.pixels.clone();
        let out = encoder.encode_delta(&delta_of(vec![tile]), 100);
        let img = webp::Decoder::new(&out[0].data).decode().unwrap();
        assert_eq!(&*img, &expected[..]);
    }

    #[test]
    fn test_empty_delta_encodes_to_nothing() {
        let encoder = TileEncoder::new().unwrap();
        assert!(encoder.encode_delta(&delta_of(vec![]), 70).is_empty());
    }
}
