//! Per-device exclusive tokens.
//!
//! The bridge channel to one device cannot be multiplexed, so every
//! operation holds its device's token from before its first bridge call
//! until after its terminal event. Tokens are independent per device;
//! waiters on the same device are served in FIFO order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct DeviceLocks {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Held for the duration of one device operation.
pub struct DeviceGuard {
    device_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceGuard {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the device's token.
    pub async fn acquire(&self, device_id: &str) -> DeviceGuard {
        let slot = self.slot(device_id);
        DeviceGuard {
            device_id: device_id.to_string(),
            _guard: slot.lock_owned().await,
        }
    }

    pub fn is_busy(&self, device_id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(device_id)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Drop the slot of a device that left the fleet, unless it is in use.
    pub fn forget(&self, device_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(device_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(device_id);
        }
    }

    fn slot(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_device_is_exclusive() {
        let locks = DeviceLocks::new();
        let guard = locks.acquire("R5CT1").await;
        assert_eq!(guard.device_id(), "R5CT1");
        assert!(locks.is_busy("R5CT1"));

        let waiter = timeout(Duration::from_millis(50), locks.acquire("R5CT1")).await;
        assert!(waiter.is_err(), "second acquire must wait");

        drop(guard);
        assert!(!locks.is_busy("R5CT1"));
    }

    #[tokio::test]
    async fn test_different_devices_are_independent() {
        let locks = DeviceLocks::new();
        let _a = locks.acquire("dev-a").await;
        let b = timeout(Duration::from_millis(50), locks.acquire("dev-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_forget_keeps_held_slots() {
        let locks = DeviceLocks::new();
        let guard = locks.acquire("dev").await;
        locks.forget("dev");
        assert!(locks.is_busy("dev"));
        drop(guard);
        locks.forget("dev");
        assert!(!locks.is_busy("dev"));
    }
}
