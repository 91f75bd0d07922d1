//! Environment Options
//!
//! Process-wide option store. A value set in-process wins over the process
//! environment variable of the same name, which wins over the caller's default.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

/// Recognised option keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvKey {
    /// Upper bound for the TASM thread group
    MultiTasmThreadSize,
    /// Upper bound for the Layout thread group
    MultiLayoutThreadSize,
    /// Share (0..=100) of hardware threads given to the high-priority pool
    ConcurrentLoopHighPriorityWorkerCountPercent,
    /// Post VSync callback trampolines with emergency grade
    IsVSyncPostTaskByEmergency,
}

impl EnvKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MultiTasmThreadSize => "MULTI_TASM_THREAD_SIZE",
            Self::MultiLayoutThreadSize => "MULTI_LAYOUT_THREAD_SIZE",
            Self::ConcurrentLoopHighPriorityWorkerCountPercent => {
                "CONCURRENT_LOOP_HIGH_PRIORITY_WORKER_COUNT_PERCENT"
            }
            Self::IsVSyncPostTaskByEmergency => "IsVSyncPostTaskByEmergency",
        }
    }
}

/// Option store
#[derive(Debug, Default)]
pub struct Env {
    overrides: RwLock<HashMap<EnvKey, String>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance
    pub fn instance() -> &'static Env {
        static INSTANCE: OnceLock<Env> = OnceLock::new();
        INSTANCE.get_or_init(Env::new)
    }

    pub fn set(&self, key: EnvKey, value: impl Into<String>) {
        self.overrides.write().insert(key, value.into());
    }

    pub fn clear(&self, key: EnvKey) {
        self.overrides.write().remove(&key);
    }

    /// Raw value, if any source provides one
    pub fn get_string(&self, key: EnvKey) -> Option<String> {
        if let Some(value) = self.overrides.read().get(&key) {
            return Some(value.clone());
        }
        std::env::var(key.as_str()).ok()
    }

    pub fn get_long(&self, key: EnvKey, default: i64) -> i64 {
        let Some(raw) = self.get_string(key) else {
            return default;
        };
        match raw.trim().parse::<i64>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Env {} has non-integer value {:?}", key.as_str(), raw);
                default
            }
        }
    }

    pub fn get_bool(&self, key: EnvKey, default: bool) -> bool {
        let Some(raw) = self.get_string(key) else {
            return default;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => {
                tracing::warn!("Env {} has non-boolean value {:?}", key.as_str(), raw);
                default
            }
        }
    }
}
