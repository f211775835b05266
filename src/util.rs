use std::{
    collections::HashMap,
    io::{ErrorKind, Result},
    sync::{Arc, Mutex, PoisonError},
};

/// Turns a NotFound I/O error into `Ok(None)`.
pub(crate) trait NotFoundFilter<T> {
    fn filter_not_found(self) -> Result<Option<T>>;
}

impl<T> NotFoundFilter<T> for Result<T> {
    fn filter_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// A set of mutexes keyed by string, created on demand.
///
/// Entries are dropped again once nobody holds or waits for them, so the map
/// only grows with the number of keys in active use.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Run `f` while holding the lock for `key`.
    ///
    /// Blocks the calling thread; call from blocking contexts only.
    pub(crate) fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one held here
        if Arc::strong_count(&entry) == 2 {
            locks.remove(key);
        }
        drop(entry);
        result
    }

    /// Run `f` holding the locks of every key in `keys`.
    ///
    /// Keys are taken in sorted order, so callers locking overlapping sets
    /// can't deadlock each other.
    pub(crate) fn with_locks<T>(&self, mut keys: Vec<String>, f: impl FnOnce() -> T) -> T {
        keys.sort();
        keys.dedup();
        self.with_sorted_locks(&keys, f)
    }

    fn with_sorted_locks<T>(&self, keys: &[String], f: impl FnOnce() -> T) -> T {
        match keys.split_first() {
            None => f(),
            Some((first, rest)) => self.with_lock(first, || self.with_sorted_locks(rest, f)),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_filter_not_found() {
        let missing: Result<()> = Err(ErrorKind::NotFound.into());
        assert!(missing.filter_not_found().unwrap().is_none());
        let denied: Result<()> = Err(ErrorKind::PermissionDenied.into());
        assert!(denied.filter_not_found().is_err());
        assert_eq!(Ok::<_, std::io::Error>(5).filter_not_found().unwrap(), Some(5));
    }

    #[test]
    fn test_keyed_locks_serialize() {
        let locks = Arc::new(KeyedLocks::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    locks.with_lock("same", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_keyed_locks_many() {
        let locks = Arc::new(KeyedLocks::default());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let mut keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
                if i % 2 == 0 {
                    keys.reverse();
                }
                keys.push("a".to_string());
                thread::spawn(move || {
                    locks.with_locks(keys, || thread::sleep(std::time::Duration::from_millis(1)))
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(locks.with_locks(vec![], || 5), 5);
        assert_eq!(locks.len(), 0);
    }
}
