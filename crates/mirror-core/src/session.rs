//! Viewer sessions: one per connected client, with the single in-flight
//! send slot that keeps a slow viewer from stalling anyone else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

pub type WsSink = Box<dyn Sink<WsMessage, Error = WsError> + Send + Unpin>;

/// Hard cap on a single payload send.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// A connected viewer. The write half lives here; the read half stays with
/// the connection handler. Engine membership is tracked as a monitor id
/// index only; lookups go through the registry.
pub struct Viewer {
    pub id: u64,
    pub addr: SocketAddr,
    sink: tokio::sync::Mutex<WsSink>,
    device_name: Mutex<String>,
    monitor_id: AtomicU32,
}

impl Viewer {
    pub fn new(id: u64, addr: SocketAddr, sink: WsSink) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr,
            sink: tokio::sync::Mutex::new(sink),
            device_name: Mutex::new("Web Companion".to_string()),
            monitor_id: AtomicU32::new(0),
        })
    }

    pub fn device_name(&self) -> String {
        self.device_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_device_name(&self, name: &str) {
        *self.device_name.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
    }

    pub fn monitor_id(&self) -> u32 {
        self.monitor_id.load(Ordering::Relaxed)
    }

    pub fn set_monitor_id(&self, monitor_id: u32) {
        self.monitor_id.store(monitor_id, Ordering::Relaxed);
    }

    pub async fn send_text(&self, text: String) -> Result<(), WsError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
    }

    pub async fn send_binary(&self, data: Bytes) -> Result<(), WsError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Binary(data.to_vec().into()))
            .await
    }

    /// Close with 1001 (going away); used by the software reset to purge
    /// OS-level socket buffers.
    pub async fn close_going_away(&self, reason: &'static str) {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: reason.into(),
        };
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
}

/// Tracks which viewers have a send in flight. At most one entry per viewer
/// exists at any time; the guard task always clears its own entry.
#[derive(Default)]
pub struct InFlightMap {
    slots: Mutex<HashMap<u64, Option<JoinHandle<()>>>>,
}

impl InFlightMap {
    /// Reserves the slot. `false` means a send is already in flight and the
    /// payload should be dropped at the source.
    pub fn claim(&self, id: u64) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(&id) {
            false
        } else {
            slots.insert(id, None);
            true
        }
    }

    /// Attaches the guard task to a claimed slot. If the guard already
    /// finished and released the slot, the handle is simply dropped.
    pub fn attach(&self, id: u64, handle: JoinHandle<()>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&id) {
            *slot = Some(handle);
        }
    }

    pub fn release(&self, id: u64) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Releases the slot and aborts a still-running guard, if any.
    pub fn abort(&self, id: u64) {
        let removed = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(Some(handle)) = removed {
            handle.abort();
        }
    }

    pub fn is_sending(&self, id: u64) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every pending guard and empties the map.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().collect()
        };
        for (_, handle) in drained {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
    }
}

/// The guarded send: one payload to one viewer under the 1 s cap. Transport
/// errors and timeouts clear the slot and keep the viewer connected; the
/// next broadcast retries.
pub async fn guarded_send(viewer: Arc<Viewer>, payload: Bytes, in_flight: Arc<InFlightMap>) {
    match timeout(SEND_TIMEOUT, viewer.send_binary(payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("send to {} failed: {e}", viewer.addr),
        Err(_) => tracing::debug!("send to {} timed out", viewer.addr),
    }
    in_flight.release(viewer.id);
}
