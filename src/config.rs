//! Boot-time configuration store.
//!
//! The embedding kernel seeds key/value pairs from its configuration file
//! before drivers load; drivers only read.

use alloc::string::{String, ToString};

use hashbrown::HashMap;
use spin::Lazy;

use crate::utils::locks::RwLock;

pub const GENERAL_POLLING: &str = "General.Polling";
pub const GENERAL_DEFERRED_WORK_WAIT_TIMEOUT_MS: &str = "General.DeferredWorkWaitTimeoutMs";
pub const GENERAL_DEFERRED_WORK_POLL_DELAY_MS: &str = "General.DeferredWorkPollDelayMs";
pub const GENERAL_DEVICE_INTERRUPT_SLOTS: &str = "General.DeviceInterruptSlots";

static CONFIG: Lazy<RwLock<HashMap<String, String>>> = Lazy::new(|| RwLock::new(HashMap::new()));

pub fn set(key: &str, value: &str) {
    CONFIG.write().insert(key.to_string(), value.to_string());
}

pub fn get(key: &str) -> Option<String> {
    CONFIG.read().get(key).cloned()
}

pub fn get_u32(key: &str) -> Option<u32> {
    get(key).and_then(|value| value.trim().parse().ok())
}

/// Truthy when the value parses to a non-zero number or equals "true"
/// (case-insensitive).
pub fn get_bool(key: &str) -> bool {
    let Some(value) = get(key) else {
        return false;
    };
    let value = value.trim();

    if let Ok(numeric) = value.parse::<u32>() {
        return numeric != 0;
    }

    value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        set("Test.Zero", "0");
        set("Test.One", "1");
        set("Test.True", "True");
        set("Test.Junk", "maybe");

        assert!(!get_bool("Test.Zero"));
        assert!(get_bool("Test.One"));
        assert!(get_bool("Test.True"));
        assert!(!get_bool("Test.Junk"));
        assert!(!get_bool("Test.Missing"));
    }

    #[test]
    fn u32_parsing() {
        set("Test.Num", " 250 ");
        assert_eq!(get_u32("Test.Num"), Some(250));
        assert_eq!(get_u32("Test.Missing"), None);
    }
}
