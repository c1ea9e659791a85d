use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Streaming profile selecting the governor's quality band and frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Gaming,
    Balanced,
    Studio,
}

/// Deployment profile. AIR is the low-power tier with hard fps ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Air,
    Warp,
    Flow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub web_port: u16,
    pub monitor_id: u32,
    pub frame_rate: u32,
    /// "full" or "WxH"; anything unparsable falls back to full.
    pub resolution: String,
    pub mode: Mode,
    pub tier: Tier,
    /// Prefer the native capture backend when available.
    pub optimize_capture_pipeline: bool,
    /// Allows the capture path known to destabilize some drivers.
    pub enable_dxcam_fallback: bool,
    pub enable_input_control: bool,
    pub language: String,
    pub webp_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            web_port: 8766,
            monitor_id: 0,
            frame_rate: 30,
            resolution: "full".to_string(),
            mode: Mode::Balanced,
            tier: Tier::Air,
            optimize_capture_pipeline: true,
            enable_dxcam_fallback: false,
            enable_input_control: true,
            language: "zh_TW".to_string(),
            webp_quality: 70,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&data).with_context(|| "failed to parse config JSON")?;
        Ok(config)
    }
}

impl ServerConfig {
    /// Output resolution, or `None` for the monitor's native size.
    pub fn target_resolution(&self) -> Option<(u32, u32)> {
        if self.resolution.eq_ignore_ascii_case("full") {
            return None;
        }
        let (w, h) = self.resolution.split_once('x')?;
        match (w.trim().parse(), h.trim().parse()) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }

    /// Engine config snapshot with tier policy applied: the unstable capture
    /// fallback never runs in the low-power tier.
    pub fn effective(&self) -> ServerConfig {
        let mut cfg = self.clone();
        if cfg.tier == Tier::Air {
            cfg.enable_dxcam_fallback = false;
        }
        cfg
    }
}
