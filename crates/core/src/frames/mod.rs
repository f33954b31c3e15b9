//! Latest-frame slots, one mailbox per device.
//!
//! Producers write into their `(module, device)` slot at any time; the
//! dispatch tick reads the whole mailbox of a device at once. Writes replace
//! the previous frame, nothing is queued.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::{Duration, Instant},
};

use crate::{capability::LedFrame, LedRouterError, Result};

/// Most recent frame from one module for one device.
#[derive(Debug, Clone)]
pub struct FrameSlot {
    pub frame: Arc<LedFrame>,
    /// When the engine accepted the frame. Staleness is measured from here.
    pub received_at: Instant,
}

impl FrameSlot {
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.received_at) > threshold
    }
}

/// Slots of every module targeting one device.
#[derive(Debug, Default)]
pub struct DeviceMailbox {
    slots: Mutex<HashMap<String, FrameSlot>>,
}

impl DeviceMailbox {
    pub fn put(&self, frame: Arc<LedFrame>, received_at: Instant) -> Result<()> {
        let module_id = frame.module_id.clone();
        self.lock()?.insert(module_id, FrameSlot { frame, received_at });
        Ok(())
    }

    pub fn take(&self, module_id: &str) -> Result<Option<FrameSlot>> {
        Ok(self.lock()?.remove(module_id))
    }

    pub fn get(&self, module_id: &str) -> Result<Option<FrameSlot>> {
        Ok(self.lock()?.get(module_id).cloned())
    }

    /// The slot for `module_id` if it is still fresh at `now`.
    pub fn fresh(
        &self,
        module_id: &str,
        now: Instant,
        threshold: Duration,
    ) -> Result<Option<FrameSlot>> {
        Ok(self
            .lock()?
            .get(module_id)
            .filter(|slot| !slot.is_stale(now, threshold))
            .cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, FrameSlot>>> {
        self.slots
            .lock()
            .map_err(|_| LedRouterError::Poisoned("device mailbox"))
    }
}

#[derive(Debug, Default)]
pub struct FrameStore {
    mailboxes: RwLock<HashMap<String, Arc<DeviceMailbox>>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox for a device, created on first use.
    pub fn mailbox(&self, device_id: &str) -> Result<Arc<DeviceMailbox>> {
        if let Some(mailbox) = self.existing(device_id)? {
            return Ok(mailbox);
        }
        let mut mailboxes = self
            .mailboxes
            .write()
            .map_err(|_| LedRouterError::Poisoned("frame store"))?;
        Ok(Arc::clone(mailboxes.entry(device_id.to_string()).or_default()))
    }

    pub fn existing(&self, device_id: &str) -> Result<Option<Arc<DeviceMailbox>>> {
        Ok(self
            .mailboxes
            .read()
            .map_err(|_| LedRouterError::Poisoned("frame store"))?
            .get(device_id)
            .cloned())
    }

    /// Stores `frame` in its slot, replacing whatever was there.
    pub fn submit(&self, frame: Arc<LedFrame>, received_at: Instant) -> Result<()> {
        self.mailbox(&frame.device_id)?.put(frame, received_at)
    }

    /// Empties one slot. Returns whether it held a frame.
    pub fn clear(&self, module_id: &str, device_id: &str) -> Result<bool> {
        match self.existing(device_id)? {
            Some(mailbox) => Ok(mailbox.take(module_id)?.is_some()),
            None => Ok(false),
        }
    }

    /// Empties every slot a module holds. Returns how many were cleared.
    pub fn clear_module(&self, module_id: &str) -> Result<usize> {
        let mailboxes: Vec<_> = self
            .mailboxes
            .read()
            .map_err(|_| LedRouterError::Poisoned("frame store"))?
            .values()
            .cloned()
            .collect();
        let mut cleared = 0;
        for mailbox in mailboxes {
            if mailbox.take(module_id)?.is_some() {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Drops the mailbox of a device that left the registry.
    pub fn purge_device(&self, device_id: &str) -> Result<()> {
        self.mailboxes
            .write()
            .map_err(|_| LedRouterError::Poisoned("frame store"))?
            .remove(device_id);
        Ok(())
    }
}
