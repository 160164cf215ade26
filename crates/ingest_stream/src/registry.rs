use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use crate::lock;

/// Opaque token a binding layer hands across an FFI boundary instead of a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleToken(u64);

impl HandleToken {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RegistryInner<T> {
    next: u64,
    entries: HashMap<HandleToken, Arc<T>>,
}

/// Arena mapping tokens to live contexts (streams, ack handles) for callback-style bindings.
///
/// Tokens are never reused. Owners must [`HandleRegistry::remove`] their token at teardown.
pub struct HandleRegistry<T> {
    inner: Mutex<RegistryInner<T>>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next: 1,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, value: T) -> HandleToken {
        let mut inner = lock(&self.inner);
        let token = HandleToken(inner.next);
        inner.next += 1;
        inner.entries.insert(token, Arc::new(value));
        token
    }

    pub fn get(&self, token: HandleToken) -> Option<Arc<T>> {
        lock(&self.inner).entries.get(&token).cloned()
    }

    pub fn remove(&self, token: HandleToken) -> Option<Arc<T>> {
        lock(&self.inner).entries.remove(&token)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, e.g. when the owning library is unloaded.
    pub fn drain(&self) -> Vec<(HandleToken, Arc<T>)> {
        lock(&self.inner).entries.drain().collect()
    }
}
