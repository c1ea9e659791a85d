/// Read access to the host clipboard. The server polls this once per second
/// and pushes changed text to all viewers.
pub trait ClipboardProvider: Send + Sync {
    /// Current clipboard text, if readable.
    fn read_text(&self) -> Option<String>;
}
