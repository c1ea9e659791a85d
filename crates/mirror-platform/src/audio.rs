use anyhow::Result;

/// Produces encoded audio packets for the length-prefixed 0x05 envelope.
/// Capture devices and codec selection live outside the streaming core; the
/// engine only frames whatever packets this yields.
pub trait AudioSource: Send {
    /// Next packet, or `None` when no audio is ready yet.
    fn next_packet(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Opens an audio source for a monitor's engine, if the host supports it.
pub trait AudioProvider: Send + Sync {
    fn open(&self, monitor_id: u32) -> Option<Box<dyn AudioSource>>;
}
