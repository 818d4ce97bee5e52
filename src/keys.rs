use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor over the configured upstream credentials.
///
/// Cloning shares the cursor, so every request handler advances the same
/// rotation.
#[derive(Debug, Clone)]
pub struct KeyRotation {
    credentials: Arc<[String]>,
    cursor: Arc<AtomicUsize>,
}

impl KeyRotation {
    /// Returns `None` for an empty credential list.
    pub fn new(credentials: Vec<String>) -> Option<Self> {
        if credentials.is_empty() {
            return None;
        }
        Some(Self {
            credentials: credentials.into(),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Returns the credential under the cursor and advances it, wrapping.
    pub fn next(&self) -> &str {
        let len = self.credentials.len();
        let idx = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur + 1) % len)
            })
            .unwrap_or_default();
        &self.credentials[idx % len]
    }
}
