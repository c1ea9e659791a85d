//! Host source provider: probes the native tier first when asked, falls back
//! to the portable CPU backend, and reports what it actually opened through
//! the source's `tier()`.

use anyhow::Result;
use mirror_platform::source::{FrameSource, MonitorInfo, SourceOptions, SourceProvider};

use crate::portable::ScrapSource;

pub struct HostProvider;

impl SourceProvider for HostProvider {
    fn open(&self, opts: &SourceOptions, prefer_native: bool) -> Result<Box<dyn FrameSource>> {
        if prefer_native {
            // The native SHM grab covers the primary monitor; secondary
            // monitors ride the portable backend's per-display capture.
            #[cfg(target_os = "linux")]
            if opts.monitor_id == 0 {
                match crate::x11::X11ShmSource::open(opts) {
                    Ok(source) => return Ok(Box::new(source)),
                    Err(e) => {
                        tracing::warn!("native capture unavailable, using portable: {e:#}");
                    }
                }
            }
        }
        Ok(Box::new(ScrapSource::open(opts)?))
    }

    fn monitors(&self) -> Vec<MonitorInfo> {
        match scrap::Display::all() {
            Ok(displays) => displays
                .iter()
                .enumerate()
                .map(|(id, d)| MonitorInfo {
                    id: id as u32,
                    width: d.width() as u32,
                    height: d.height() as u32,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("display enumeration failed: {e}");
                Vec::new()
            }
        }
    }
}
