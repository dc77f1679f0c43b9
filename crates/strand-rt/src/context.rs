//! Per-coroutine context store.
//!
//! Each coroutine owns a key/value map, created as a snapshot of its parent's
//! map at the instant of spawn and discarded when the coroutine finishes.
//! Writes after the snapshot are invisible in both directions, and siblings
//! never see each other's values. Code running outside any unit reads and
//! writes a root map with the same operations.
//!
//! The store is a lookup-only index keyed by coroutine id — it never owns the
//! coroutine, so dropping a record can't be blocked by a live context.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::coro::{self, CoroId};

/// A stored context value. `Arc` because the snapshot at spawn is shallow:
/// parent and child share the value, not the slot.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

type ContextMap = HashMap<String, ContextValue>;

struct Store {
    maps: Mutex<HashMap<CoroId, ContextMap>>,
    root: Mutex<ContextMap>,
}

thread_local! {
    static STORE: Store = Store {
        maps: Mutex::new(HashMap::new()),
        root: Mutex::new(HashMap::new()),
    };
}

fn with_current_map<R>(f: impl FnOnce(&mut ContextMap) -> R) -> R {
    STORE.with(|store| match coro::current() {
        Some(id) => {
            let mut maps = store.maps.lock().unwrap();
            f(maps.entry(id).or_default())
        }
        None => f(&mut store.root.lock().unwrap()),
    })
}

/// Set `key` in the calling coroutine's own context.
pub fn set<V: Any + Send + Sync>(key: impl Into<String>, value: V) {
    let value: ContextValue = Arc::new(value);
    with_current_map(|map| {
        map.insert(key.into(), value);
    })
}

/// Look up `key` in the calling coroutine's own context. `None` is the
/// distinguished absent marker — a present key may hold any value, including
/// `()`.
pub fn get(key: &str) -> Option<ContextValue> {
    with_current_map(|map| map.get(key).cloned())
}

/// [`get`] plus a downcast to the expected type. `None` if the key is absent
/// or holds a different type.
pub fn get_as<V: Any + Send + Sync>(key: &str) -> Option<Arc<V>> {
    get(key).and_then(|v| v.downcast::<V>().ok())
}

/// Empty the calling coroutine's own context. Siblings and the parent keep
/// theirs.
pub fn clear() {
    with_current_map(|map| map.clear())
}

/// Snapshot the caller's context into `child`'s slot. Called by the launcher
/// exactly once per spawn, before the child's first poll.
pub(crate) fn adopt(child: CoroId) {
    STORE.with(|store| {
        let snapshot = match coro::current() {
            Some(parent) => store
                .maps
                .lock()
                .unwrap()
                .get(&parent)
                .cloned()
                .unwrap_or_default(),
            None => store.root.lock().unwrap().clone(),
        };
        store.maps.lock().unwrap().insert(child, snapshot);
    })
}

/// Drop a finished coroutine's context.
pub(crate) fn discard(id: CoroId) {
    STORE.with(|store| {
        store.maps.lock().unwrap().remove(&id);
    })
}

/// Fork reset: no context survives process duplication, the root included.
pub(crate) fn reset() {
    STORE.with(|store| {
        store.maps.lock().unwrap().clear();
        store.root.lock().unwrap().clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::go;
    use crate::error::Error;
    use crate::executor::block_on;
    use crate::timer::sleep;
    use std::time::Duration;

    fn get_str(key: &str) -> Option<String> {
        get_as::<String>(key).map(|v| (*v).clone())
    }

    #[test]
    fn absent_key_is_none_present_unit_is_some() {
        assert!(get("missing").is_none());
        set("present", ());
        assert!(get("present").is_some());
        clear();
    }

    #[test]
    fn child_inherits_parent_values_at_spawn() {
        set("k", "parent".to_string());
        let (p, _h) = go(async { Ok::<_, Error>(get_str("k")) });
        assert_eq!(block_on(p).unwrap(), Some("parent".to_string()));
        clear();
    }

    #[test]
    fn siblings_are_isolated_and_parent_unaffected() {
        set("k", 0u32);

        let (a, _) = go(async {
            set("k", 1u32);
            sleep(Duration::from_millis(5)).await;
            Ok::<_, Error>(get_as::<u32>("k").map(|v| *v))
        });
        let (b, _) = go(async {
            set("k", 2u32);
            sleep(Duration::from_millis(5)).await;
            Ok::<_, Error>(get_as::<u32>("k").map(|v| *v))
        });

        let (got_a, got_b) = block_on(async move { (a.await.unwrap(), b.await.unwrap()) });
        assert_eq!(got_a, Some(1));
        assert_eq!(got_b, Some(2));
        assert_eq!(get_as::<u32>("k").map(|v| *v), Some(0));
        clear();
    }

    #[test]
    fn parent_writes_after_spawn_are_invisible_to_the_child() {
        set("k", "before".to_string());
        let (p, _h) = go(async {
            sleep(Duration::from_millis(10)).await;
            Ok::<_, Error>(get_str("k"))
        });
        set("k", "after".to_string());
        assert_eq!(block_on(p).unwrap(), Some("before".to_string()));
        clear();
    }

    #[test]
    fn clear_is_local_to_the_calling_coroutine() {
        set("k", "root".to_string());

        let (cleared, _) = go(async {
            clear();
            Ok::<_, Error>(get("k").is_none())
        });
        let (sibling, _) = go(async {
            sleep(Duration::from_millis(5)).await;
            Ok::<_, Error>(get_str("k"))
        });

        let (was_cleared, kept) =
            block_on(async move { (cleared.await.unwrap(), sibling.await.unwrap()) });
        assert!(was_cleared);
        assert_eq!(kept, Some("root".to_string()));
        assert_eq!(get_str("k"), Some("root".to_string()));
        clear();
    }

    #[test]
    fn context_is_discarded_with_its_coroutine() {
        let before = STORE.with(|s| s.maps.lock().unwrap().len());
        let (p, _h) = go(async {
            set("tmp", 1u8);
            Ok::<_, Error>(())
        });
        block_on(p).unwrap();
        assert_eq!(STORE.with(|s| s.maps.lock().unwrap().len()), before);
    }
}
