//! Boundary to whatever ships finished frames to hardware.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{capability::LedFrame, TransportError};

/// Accepts one finished frame per device per tick. Protocol encoding,
/// retries and reconnection belong to the implementation.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn send(&self, device_id: &str, frame: Arc<LedFrame>) -> Result<(), TransportError>;
}

/// Sink that only traces a short summary of each frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl TransportSink for LogSink {
    async fn send(&self, device_id: &str, frame: Arc<LedFrame>) -> Result<(), TransportError> {
        let lit = frame.pixels.iter().filter(|p| (p.r | p.g | p.b) != 0).count();
        tracing::debug!(
            device_id,
            module_id = %frame.module_id,
            mode = %frame.mode,
            pixels = frame.len(),
            lit,
            "frame sent"
        );
        Ok(())
    }
}

/// Records every delivered frame. Devices can be marked as failing to
/// exercise error paths.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    sent: HashMap<String, Vec<Arc<LedFrame>>>,
    failing: HashSet<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later send to `device_id` fails with `Unreachable`.
    pub fn fail_device(&self, device_id: impl Into<String>) {
        if let Ok(mut state) = self.inner.lock() {
            state.failing.insert(device_id.into());
        }
    }

    pub fn recover_device(&self, device_id: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state.failing.remove(device_id);
        }
    }

    /// Frames delivered to a device, oldest first.
    pub fn sent(&self, device_id: &str) -> Vec<Arc<LedFrame>> {
        self.inner
            .lock()
            .map(|state| state.sent.get(device_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn last(&self, device_id: &str) -> Option<Arc<LedFrame>> {
        self.sent(device_id).pop()
    }

    pub fn total(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.sent.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&self, device_id: &str, frame: Arc<LedFrame>) -> Result<(), TransportError> {
        let mut state = self.inner.lock().map_err(|_| TransportError::Closed)?;
        if state.failing.contains(device_id) {
            return Err(TransportError::Unreachable(device_id.to_string()));
        }
        state.sent.entry(device_id.to_string()).or_default().push(frame);
        Ok(())
    }
}
