use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

type Entry = Arc<dyn Any + Send + Sync>;

/// Slave-local storage that outlives a single stage invocation.
///
/// Stages address their entries by stable string keys and read them back through typed
/// accessors; a key holding a different type than requested is reported, never reinterpreted.
#[derive(Debug, Default)]
pub struct SlaveState {
    inner: Mutex<HashMap<String, Entry>>,
}

impl SlaveState {
    pub fn set<T>(&self, key: &str, value: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.insert(key.to_string(), value);
    }

    pub fn get<T>(&self, key: &str) -> Result<Option<Arc<T>>, SlaveStateError>
    where
        T: Any + Send + Sync,
    {
        let entry = {
            let inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.get(key).cloned()
        };

        entry.map(|e| downcast(key, e)).transpose()
    }

    /// Returns the entry under `key`, creating it with `init` on first use. The boolean is `true`
    /// when the entry was created by this call.
    pub fn get_or_insert_with<T, F>(
        &self,
        key: &str,
        init: F,
    ) -> Result<(Arc<T>, bool), SlaveStateError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = inner.get(key).cloned() {
            return downcast(key, existing).map(|v| (v, false));
        }

        let value = Arc::new(init());
        inner.insert(key.to_string(), value.clone());
        Ok((value, true))
    }

    /// Removes and returns the entry under `key`; absent keys yield `Ok(None)`.
    pub fn remove<T>(&self, key: &str) -> Result<Option<Arc<T>>, SlaveStateError>
    where
        T: Any + Send + Sync,
    {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(existing) = inner.get(key).cloned() else {
            return Ok(None);
        };
        let typed = downcast(key, existing)?;
        inner.remove(key);
        Ok(Some(typed))
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.contains_key(key)
    }

    pub fn clear(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.clear();
    }
}

fn downcast<T>(key: &str, entry: Entry) -> Result<Arc<T>, SlaveStateError>
where
    T: Any + Send + Sync,
{
    entry
        .downcast::<T>()
        .map_err(|_| SlaveStateError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<T>(),
        })
}

#[derive(Debug, thiserror::Error)]
pub enum SlaveStateError {
    #[error("slave state entry `{key}` is not a `{expected}`")]
    TypeMismatch { key: String, expected: &'static str },
}
