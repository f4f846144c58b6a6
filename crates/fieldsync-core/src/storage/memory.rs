//! In-process object store for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::object_store::{normalize_object_key, CloudError, ObjectStore};

/// Object store kept in a hash map, with failure injection.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    fail_remaining: AtomicU32,
    corrupt_writes: AtomicBool,
    failing_writes: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing failure injection.
    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.object(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every call while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Flip a byte of every object written from now on.
    pub fn set_corrupt_writes(&self, corrupt: bool) {
        self.corrupt_writes.store(corrupt, Ordering::SeqCst);
    }

    /// Fail writes whose key contains `pattern`.
    pub fn fail_writes_containing(&self, pattern: &str) {
        *self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pattern.to_string());
    }

    /// Number of driver calls received.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn admit(&self) -> Result<(), CloudError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Backend("memory store is offline".into()));
        }
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CloudError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put_object(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), CloudError> {
        self.admit()?;
        let key = normalize_object_key(key)?;
        let rejected = self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|pattern| key.contains(pattern));
        if rejected {
            return Err(CloudError::Backend(format!("injected write failure for {key}")));
        }
        let mut bytes = bytes.to_vec();
        if self.corrupt_writes.load(Ordering::SeqCst) {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            } else {
                bytes.push(0);
            }
        }
        self.insert(&key, bytes);
        Ok(())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, CloudError> {
        self.admit()?;
        let key = normalize_object_key(key)?;
        self.object(&key).ok_or(CloudError::NotFound(key))
    }

    fn delete_object(&self, key: &str) -> Result<(), CloudError> {
        self.admit()?;
        let key = normalize_object_key(key)?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        format!("memory://objects/{}", key.trim_matches('/'))
    }
}
