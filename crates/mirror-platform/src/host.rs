use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

/// Host load figures for the dashboard stats surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HostStats {
    /// CPU usage percent since the previous sample.
    pub cpu: f32,
    /// RAM usage percent.
    pub ram: f32,
    /// Seconds since the server started.
    pub uptime: u64,
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples host CPU and memory. CPU percent is computed from the delta
/// between consecutive samples, so the first call reports 0.
pub struct HostSampler {
    started: Instant,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_cpu: Mutex::new(read_cpu_times()),
        }
    }

    pub fn sample(&self) -> HostStats {
        let cpu = match read_cpu_times() {
            Some(now) => {
                let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
                let pct = match *last {
                    Some(prev) if now.total > prev.total => {
                        let busy = now.busy.saturating_sub(prev.busy) as f32;
                        let total = (now.total - prev.total) as f32;
                        (busy / total * 100.0).clamp(0.0, 100.0)
                    }
                    _ => 0.0,
                };
                *last = Some(now);
                pct
            }
            None => 0.0,
        };

        HostStats {
            cpu,
            ram: read_ram_percent().unwrap_or(0.0),
            uptime: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

#[cfg(target_os = "linux")]
fn read_ram_percent() -> Option<f32> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f32 / total as f32 * 100.0)
}

#[cfg(not(target_os = "linux"))]
fn read_ram_percent() -> Option<f32> {
    None
}
