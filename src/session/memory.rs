//! In-process session backend with lazy expiry.
//!
//! Entries are checked against their expiry when read; an expired entry is
//! removed as a side effect. [`MemoryBackend::sweep_expired`] clears the
//! rest. Nothing is written to disk.

use super::{BackendKind, SessionBackend};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

/// Internal entry with expiry tracking.
struct Slot {
    value: Value,
    expires_at: DateTime<Utc>,
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl SessionBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn put(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) -> Result<()> {
        self.slots.lock().insert(
            key.to_string(),
            Slot {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Utc::now();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_expired(now) => {
                slots.remove(key);
                Ok(None)
            }
            Some(slot) => Ok(Some(slot.value.clone())),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .slots
            .lock()
            .remove(key)
            .is_some_and(|slot| !slot.is_expired(now)))
    }

    fn touch(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) -> Result<bool> {
        let now = Utc::now();
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if !slot.is_expired(now) => {
                slot.value = value.clone();
                slot.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn take(&self, key: &str) -> Result<Option<Value>> {
        let now = Utc::now();
        Ok(self
            .slots
            .lock()
            .remove(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let now = Utc::now();
        let slots = self.slots.lock();
        Ok(slots
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && !slot.is_expired(now))
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect())
    }

    fn sweep_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_expired(now));
        let removed = (before - slots.len()) as u64;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired in-process entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn expired_entry_is_deleted_on_read() {
        let backend = MemoryBackend::new();
        backend
            .put("session:a", &json!({"user_id": "u1"}), Utc::now() - Duration::seconds(1))
            .unwrap();
        assert_eq!(backend.len(), 1);
        assert!(backend.get("session:a").unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn delete_reports_live_entries_only() {
        let backend = MemoryBackend::new();
        backend
            .put("session:live", &json!(1), Utc::now() + Duration::hours(1))
            .unwrap();
        backend
            .put("session:dead", &json!(2), Utc::now() - Duration::hours(1))
            .unwrap();
        assert!(backend.delete("session:live").unwrap());
        assert!(!backend.delete("session:dead").unwrap());
        assert!(!backend.delete("session:none").unwrap());
        assert!(backend.is_empty());
    }

    #[test]
    fn touch_never_recreates() {
        let backend = MemoryBackend::new();
        let later = Utc::now() + Duration::hours(1);
        assert!(!backend.touch("session:a", &json!(1), later).unwrap());
        assert!(backend.get("session:a").unwrap().is_none());

        backend.put("session:a", &json!(1), later).unwrap();
        assert!(backend.touch("session:a", &json!(2), later).unwrap());
        assert_eq!(backend.get("session:a").unwrap(), Some(json!(2)));

        backend.delete("session:a").unwrap();
        assert!(!backend.touch("session:a", &json!(3), later).unwrap());
        assert!(backend.is_empty());

        backend
            .put("session:b", &json!(1), Utc::now() - Duration::seconds(1))
            .unwrap();
        assert!(!backend.touch("session:b", &json!(2), later).unwrap());
        assert!(backend.get("session:b").unwrap().is_none());
    }

    #[test]
    fn take_hands_out_a_value_once() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        backend
            .put("reset:a", &json!("x"), Utc::now() + Duration::hours(1))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backend = std::sync::Arc::clone(&backend);
                std::thread::spawn(move || backend.take("reset:a").unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);

        backend
            .put("reset:old", &json!("y"), Utc::now() - Duration::seconds(1))
            .unwrap();
        assert!(backend.take("reset:old").unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn scan_respects_prefix_and_expiry() {
        let backend = MemoryBackend::new();
        let later = Utc::now() + Duration::hours(1);
        backend.put("session:1", &json!(1), later).unwrap();
        backend.put("reset:1", &json!(2), later).unwrap();
        backend
            .put("session:2", &json!(3), Utc::now() - Duration::hours(1))
            .unwrap();

        let found = backend.scan_prefix("session:").unwrap();
        assert_eq!(found, vec![("session:1".to_string(), json!(1))]);
    }

    #[test]
    fn sweep_counts_removed() {
        let backend = MemoryBackend::new();
        let past = Utc::now() - Duration::seconds(5);
        backend.put("a", &json!(1), past).unwrap();
        backend.put("b", &json!(2), past).unwrap();
        backend
            .put("c", &json!(3), Utc::now() + Duration::hours(1))
            .unwrap();
        assert_eq!(backend.sweep_expired().unwrap(), 2);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn concurrent_writers() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let later = Utc::now() + Duration::hours(1);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let backend = std::sync::Arc::clone(&backend);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        backend
                            .put(&format!("session:{t}:{i}"), &json!(i), later)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(backend.len(), 800);
    }
}
