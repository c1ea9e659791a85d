use anyhow::Result;

/// Sink for opaque viewer input events. The server forwards binary frames
/// whose first byte is 0x03 or 0x04 without interpreting them; injection into
/// the host OS lives behind this seam.
pub trait InputSink: Send + Sync {
    fn inject(&self, event: &[u8]) -> Result<()>;
}

/// Discards events. Used when input control is disabled or no injector is
/// wired up.
pub struct NullInput;

impl InputSink for NullInput {
    fn inject(&self, event: &[u8]) -> Result<()> {
        tracing::debug!("dropping {}-byte input event (no injector)", event.len());
        Ok(())
    }
}
