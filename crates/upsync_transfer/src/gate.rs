use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Snapshot of network and power state as reported by the host device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConditions {
    pub connected: bool,
    #[serde(default)]
    pub internet_walled: bool,
    pub on_wifi: bool,
    pub charging: bool,
    #[serde(default)]
    pub power_save: bool,
}

impl DeviceConditions {
    /// Connected over Wi-Fi, plugged in, no power saving.
    pub fn online() -> Self {
        Self {
            connected: true,
            internet_walled: false,
            on_wifi: true,
            charging: true,
            power_save: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            ..Self::online()
        }
    }

    pub fn has_internet(&self) -> bool {
        self.connected && !self.internet_walled
    }
}

pub trait ConditionsProvider: Send + Sync {
    fn current(&self) -> DeviceConditions;
}

/// Conditions pushed in from outside (host agent, HTTP, tests).
#[derive(Debug)]
pub struct StaticConditions {
    inner: RwLock<DeviceConditions>,
}

impl StaticConditions {
    pub fn new(initial: DeviceConditions) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn set(&self, conditions: DeviceConditions) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = conditions;
    }
}

impl ConditionsProvider for StaticConditions {
    fn current(&self) -> DeviceConditions {
        *self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// User-settable global pause flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct PauseSwitch {
    paused: Arc<AtomicBool>,
}

impl PauseSwitch {
    pub fn set(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed(DeviceConditions),
    PausedByUser,
    NoConnectivity,
}

/// Per-record precondition check. Cheap and non-blocking.
#[derive(Clone)]
pub struct Gate {
    conditions: Arc<dyn ConditionsProvider>,
    pause: PauseSwitch,
}

impl Gate {
    pub fn new(conditions: Arc<dyn ConditionsProvider>, pause: PauseSwitch) -> Self {
        Self { conditions, pause }
    }

    pub fn can_proceed(&self) -> GateDecision {
        if self.pause.is_paused() {
            return GateDecision::PausedByUser;
        }
        let conditions = self.conditions.current();
        if !conditions.has_internet() {
            return GateDecision::NoConnectivity;
        }
        GateDecision::Proceed(conditions)
    }
}
