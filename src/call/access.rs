//! Access-grant store.
//!
//! Other UI surfaces consult this registry to decide whether call controls
//! are visible for a session. A grant is written on entering
//! `connected`/`incoming` and cleared on `ended`.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct AccessGrants {
    granted: Mutex<HashSet<String>>,
}

impl AccessGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, session_id: &str) {
        if let Ok(mut set) = self.granted.lock() {
            set.insert(session_id.to_string());
        }
    }

    pub fn clear(&self, session_id: &str) {
        if let Ok(mut set) = self.granted.lock() {
            set.remove(session_id);
        }
    }

    pub fn is_granted(&self, session_id: &str) -> bool {
        self.granted
            .lock()
            .map(|set| set.contains(session_id))
            .unwrap_or(false)
    }
}
