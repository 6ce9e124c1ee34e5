use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub storage_path: String,
    pub namespace: String,
    pub local_user: String,
    pub local_device: u32,
    pub read_receipts_enabled: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: ".courier".to_string(),
            namespace: "default".to_string(),
            local_user: String::new(),
            local_device: 1,
            read_receipts_enabled: true,
        }
    }
}

/// Snapshot of the device/environment state that constraints evaluate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceState {
    pub network_available: bool,
    pub charging: bool,
    pub migrations_pending: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            network_available: true,
            charging: false,
            migrations_pending: false,
        }
    }
}

/// Injected accessor for device state, replacing any process-wide singleton.
/// Setters that make a gating predicate newly true notify registered
/// listeners so the scheduler re-evaluates blocked jobs promptly.
#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<Mutex<DeviceState>>,
    listeners: Arc<Mutex<Vec<Arc<Notify>>>>,
}

impl StateHandle {
    pub fn new(state: DeviceState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            listeners: Arc::default(),
        }
    }

    pub fn snapshot(&self) -> DeviceState {
        *self.inner.lock().expect("device state")
    }

    pub fn register_listener(&self, notify: Arc<Notify>) {
        self.listeners.lock().expect("listeners").push(notify);
    }

    pub fn set_network_available(&self, available: bool) {
        let became_true = self.update(|state| {
            let change = available && !state.network_available;
            state.network_available = available;
            change
        });
        if became_true {
            self.notify_all();
        }
    }

    pub fn set_charging(&self, charging: bool) {
        let became_true = self.update(|state| {
            let change = charging && !state.charging;
            state.charging = charging;
            change
        });
        if became_true {
            self.notify_all();
        }
    }

    pub fn set_migrations_pending(&self, pending: bool) {
        let became_true = self.update(|state| {
            let change = !pending && state.migrations_pending;
            state.migrations_pending = pending;
            change
        });
        if became_true {
            self.notify_all();
        }
    }

    fn update(&self, f: impl FnOnce(&mut DeviceState) -> bool) -> bool {
        let mut guard = self.inner.lock().expect("device state");
        f(&mut guard)
    }

    fn notify_all(&self) {
        for listener in self.listeners.lock().expect("listeners").iter() {
            listener.notify_one();
        }
    }
}
