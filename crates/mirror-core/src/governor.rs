//! Closed-loop stream controller. Consumes viewer telemetry and produces
//! quality / tile-size / frame-rate decisions with hysteresis. Pure state
//! machine: no I/O, no blocking.

use std::time::{Duration, Instant};

use crate::config::{Mode, Tier};
use crate::protocol::{Backpressure, ClientStats};

#[derive(Debug, Clone, Copy)]
pub struct ModeProfile {
    pub fps: u32,
    pub min_q: f64,
    pub max_q: f64,
    pub target_q: f64,
}

impl Mode {
    pub fn profile(self) -> ModeProfile {
        match self {
            Mode::Gaming => ModeProfile {
                fps: 60,
                min_q: 30.0,
                max_q: 80.0,
                target_q: 65.0,
            },
            Mode::Balanced => ModeProfile {
                fps: 45,
                min_q: 20.0,
                max_q: 90.0,
                target_q: 75.0,
            },
            Mode::Studio => ModeProfile {
                fps: 30,
                min_q: 50.0,
                max_q: 100.0,
                target_q: 95.0,
            },
        }
    }
}

/// Minimum spacing between applied updates.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

const QUALITY_DEADBAND: f64 = 5.0;
const MIN_FOVEATED_RADIUS: i32 = 80;
const MAX_FOVEATED_RADIUS: i32 = 400;

/// Last-reported viewer metadata, kept for the dashboard.
#[derive(Debug, Clone)]
pub struct ViewerTelemetry {
    pub mode: String,
    pub battery: u32,
    pub is_charging: bool,
    pub fps: f32,
}

pub struct Governor {
    tier: Tier,
    target_fps: u32,
    current_quality: f64,
    min_quality: f64,
    max_quality: f64,
    current_tile_size: u32,
    last_update: Option<Instant>,
    last_applied_quality: f64,
    telemetry: ViewerTelemetry,
    cursor: (i32, i32),
    foveated_radius: i32,
}

impl Governor {
    pub fn new(mode: Mode, tier: Tier) -> Self {
        let profile = mode.profile();
        // Low-power tier always caps the frame rate for battery reasons.
        let target_fps = if tier == Tier::Air { 20 } else { profile.fps };
        Self {
            tier,
            target_fps,
            current_quality: profile.target_q,
            min_quality: profile.min_q,
            max_quality: profile.max_q,
            current_tile_size: 128,
            last_update: None,
            last_applied_quality: profile.target_q,
            telemetry: ViewerTelemetry {
                mode: "NORMAL".to_string(),
                battery: 100,
                is_charging: true,
                fps: 0.0,
            },
            cursor: (0, 0),
            foveated_radius: 200,
        }
    }

    pub fn update(&mut self, stats: &ClientStats) {
        self.update_at(stats, Instant::now());
    }

    pub(crate) fn update_at(&mut self, stats: &ClientStats, now: Instant) {
        // Rate limit to avoid oscillation.
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < UPDATE_INTERVAL {
                return;
            }
        }

        self.telemetry = ViewerTelemetry {
            mode: stats.mode.clone(),
            battery: stats.battery,
            is_charging: stats.is_charging,
            fps: stats.fps,
        };
        if let (Some(x), Some(y)) = (stats.focus_x, stats.focus_y) {
            self.cursor = (x, y);
        }

        if self.tier == Tier::Air {
            self.target_fps = if stats.mode == "SUPER_ECO" { 10 } else { 20 };
        }

        // Primary signal is the pending-tile queue; secondary is decode time.
        let queue_pressure = (f64::from(stats.pending_tiles).max(20.0) - 20.0) / 50.0;
        let mut decode_pressure = (f64::from(stats.avg_decode_ms) - 10.0).max(0.0) / 20.0;
        // High bandwidth means many small tiles; nudge toward coarser ones.
        if stats.bandwidth_kbps > 5000.0 {
            decode_pressure += 0.3;
        }
        if stats.backpressure == Backpressure::Heavy {
            decode_pressure += 0.5;
        }
        let total_pressure = queue_pressure + decode_pressure;

        // Foveated radius only moves when a focus stream declares itself.
        if self.tier == Tier::Flow {
            if total_pressure > 0.3 {
                self.foveated_radius = (self.foveated_radius - 40).max(MIN_FOVEATED_RADIUS);
            } else if total_pressure < 0.05 {
                self.foveated_radius = (self.foveated_radius + 10).min(MAX_FOVEATED_RADIUS);
            }
        }

        // Multiplicative drop under pressure, slow additive recovery.
        let mut new_quality = self.current_quality;
        if total_pressure > 0.1 {
            new_quality /= 1.0 + total_pressure.min(0.5);
        } else {
            new_quality += 2.0;
        }
        new_quality = new_quality.clamp(self.min_quality, self.max_quality);

        // Deadband, with an override so hitting a bound always lands.
        let hits_bound = (new_quality == self.min_quality
            && self.last_applied_quality != self.min_quality)
            || (new_quality == self.max_quality && self.last_applied_quality != self.max_quality);
        if (new_quality - self.last_applied_quality).abs() > QUALITY_DEADBAND || hits_bound {
            self.current_quality = new_quality;
            self.last_applied_quality = new_quality;
        }

        if decode_pressure > 0.5 {
            self.current_tile_size = if decode_pressure > 0.8 { 512 } else { 256 };
        } else if total_pressure < 0.05 {
            self.current_tile_size = 128;
        }

        self.last_update = Some(now);
    }

    pub fn quality(&self) -> u8 {
        self.current_quality as u8
    }

    pub fn tile_size(&self) -> u32 {
        self.current_tile_size
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn foveated_radius(&self) -> i32 {
        self.foveated_radius
    }

    pub fn update_cursor(&mut self, x: i32, y: i32) {
        self.cursor = (x, y);
    }

    pub fn is_in_foveated_region(&self, tx: i32, ty: i32, tw: i32, th: i32) -> bool {
        let (cx, cy) = self.cursor;
        let r = self.foveated_radius;
        !(tx + tw < cx - r || tx > cx + r || ty + th < cy - r || ty > cy + r)
    }

    pub fn telemetry(&self) -> &ViewerTelemetry {
        &self.telemetry
    }
}
