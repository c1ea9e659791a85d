use anyhow::Result;
use async_trait::async_trait;

/// LAN service advertisement (mDNS or similar). The server announces its
/// name and bound port once at startup and withdraws on shutdown.
#[async_trait]
pub trait DiscoveryBeacon: Send + Sync {
    async fn start(&self, service_name: &str, port: u16) -> Result<()>;
    async fn stop(&self);
}

/// Advertises nothing. Used when no beacon implementation is wired up.
pub struct NoDiscovery;

#[async_trait]
impl DiscoveryBeacon for NoDiscovery {
    async fn start(&self, service_name: &str, port: u16) -> Result<()> {
        tracing::debug!("discovery disabled, not advertising {service_name} on {port}");
        Ok(())
    }

    async fn stop(&self) {}
}
