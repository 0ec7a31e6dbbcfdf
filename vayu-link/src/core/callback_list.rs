//! Thread-safe subscription list
//!
//! Callbacks may subscribe or unsubscribe (themselves or others) while the
//! list is being executed. Mutations never block on the live list: they take
//! it with `try_lock` and fall back to pending queues which are merged in
//! before the next dispatch.
//!
//! Lock order: live list first, then a pending queue. Pending queues are only
//! ever held for a push or a drain, never across a callback.

use super::handle::{Handle, HandleFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Plain subscriber
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Subscriber that is dropped the first time it returns `true`
pub type ConditionalCallback<T> = Arc<dyn Fn(T) -> bool + Send + Sync>;

/// Handle type issued by a [`CallbackList<T>`]
pub type CallbackHandle<T> = Handle<dyn Fn(T) + Send + Sync>;

/// Work item handed to an executor by [`CallbackList::queue`]
pub type QueuedCallback = Box<dyn FnOnce() + Send>;

struct Conditional<T> {
    callback: ConditionalCallback<T>,
    /// Set once the predicate returned true (possibly on the executor)
    done: Arc<AtomicBool>,
}

impl<T> Conditional<T> {
    fn new(callback: ConditionalCallback<T>) -> Self {
        Self {
            callback,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

struct Live<T> {
    plain: Vec<(CallbackHandle<T>, Callback<T>)>,
    conditional: Vec<Conditional<T>>,
}

impl<T> Live<T> {
    fn len(&self) -> usize {
        self.plain.len() + self.conditional.len()
    }
}

struct PendingRemovals<T> {
    handles: Vec<CallbackHandle<T>>,
    clear_plain: bool,
    clear_conditional: bool,
}

/// Subscription list for callbacks taking `T`
pub struct CallbackList<T> {
    factory: HandleFactory<dyn Fn(T) + Send + Sync>,
    live: Mutex<Live<T>>,
    live_count: AtomicUsize,
    subscribe_later: Mutex<Vec<(CallbackHandle<T>, Callback<T>)>>,
    subscribe_conditional_later: Mutex<Vec<Conditional<T>>>,
    remove_later: Mutex<PendingRemovals<T>>,
}

impl<T: Clone> CallbackList<T> {
    pub fn new() -> Self {
        Self {
            factory: HandleFactory::new(),
            live: Mutex::new(Live {
                plain: Vec::new(),
                conditional: Vec::new(),
            }),
            live_count: AtomicUsize::new(0),
            subscribe_later: Mutex::new(Vec::new()),
            subscribe_conditional_later: Mutex::new(Vec::new()),
            remove_later: Mutex::new(PendingRemovals {
                handles: Vec::new(),
                clear_plain: false,
                clear_conditional: false,
            }),
        }
    }

    /// Add a callback; the returned handle is valid immediately
    pub fn subscribe<F>(&self, callback: F) -> CallbackHandle<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_callback(Some(Arc::new(callback)))
    }

    /// Add a callback, or clear all plain callbacks when given `None`
    ///
    /// Passing `None` is the legacy way of unsubscribing everything and
    /// returns the null handle.
    pub fn subscribe_callback(&self, callback: Option<Callback<T>>) -> CallbackHandle<T> {
        let Some(callback) = callback else {
            log::warn!("Subscribing a null callback to clear the list is deprecated, use unsubscribe");
            self.try_clear(true, false);
            return Handle::null();
        };

        let handle = self.factory.create();
        match self.live.try_lock() {
            Some(mut live) => {
                self.merge_pending(&mut live);
                live.plain.push((handle, callback));
                self.store_count(&live);
            }
            None => self.subscribe_later.lock().push((handle, callback)),
        }
        handle
    }

    /// Add a callback that is removed the first time it returns `true`
    pub fn subscribe_conditional<F>(&self, callback: F)
    where
        F: Fn(T) -> bool + Send + Sync + 'static,
    {
        self.subscribe_conditional_callback(Some(Arc::new(callback)));
    }

    /// Add a conditional callback, or clear all conditional callbacks on `None`
    pub fn subscribe_conditional_callback(&self, callback: Option<ConditionalCallback<T>>) {
        let Some(callback) = callback else {
            log::warn!("Subscribing a null conditional callback to clear the list is deprecated");
            self.try_clear(false, true);
            return;
        };

        let entry = Conditional::new(callback);
        match self.live.try_lock() {
            Some(mut live) => {
                self.merge_pending(&mut live);
                live.conditional.push(entry);
                self.store_count(&live);
            }
            None => self.subscribe_conditional_later.lock().push(entry),
        }
    }

    /// Remove a callback; never blocks, safe to call from inside a callback
    pub fn unsubscribe(&self, handle: CallbackHandle<T>) {
        if !handle.valid() {
            log::error!("Ignoring unsubscribe of null handle");
            return;
        }

        // A subscription that hasn't been merged yet is dropped right away.
        self.subscribe_later.lock().retain(|(h, _)| *h != handle);

        match self.live.try_lock() {
            Some(mut live) => {
                self.merge_pending(&mut live);
                live.plain.retain(|(h, _)| *h != handle);
                self.store_count(&live);
            }
            None => self.remove_later.lock().handles.push(handle),
        }
    }

    /// Call every callback with `args`, in subscription order
    ///
    /// Plain callbacks run first, then conditional ones; conditionals that
    /// return `true` are removed. Must not be called from inside one of this
    /// list's own callbacks.
    pub fn exec(&self, args: T) {
        let mut live = self.live.lock();
        self.merge_pending(&mut live);

        for (_, callback) in &live.plain {
            callback(args.clone());
        }

        live.conditional.retain(|entry| {
            if entry.is_done() {
                return false;
            }
            if (entry.callback)(args.clone()) {
                entry.done.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });

        self.store_count(&live);
    }

    /// Like [`exec`](Self::exec) but hands each call to `enqueue` instead of
    /// running it
    ///
    /// A conditional callback is removed once one of its queued calls has
    /// returned `true`; later queued calls for it are skipped.
    pub fn queue<E>(&self, args: T, enqueue: E)
    where
        T: Send + 'static,
        E: Fn(QueuedCallback),
    {
        let mut live = self.live.lock();
        self.merge_pending(&mut live);

        for (_, callback) in &live.plain {
            let callback = Arc::clone(callback);
            let args = args.clone();
            enqueue(Box::new(move || callback(args)));
        }

        for entry in &live.conditional {
            let callback = Arc::clone(&entry.callback);
            let done = Arc::clone(&entry.done);
            let args = args.clone();
            enqueue(Box::new(move || {
                if !done.load(Ordering::Acquire) && callback(args) {
                    done.store(true, Ordering::Release);
                }
            }));
        }

        self.store_count(&live);
    }

    /// True when no callback is subscribed; never blocks on a running `exec`
    pub fn empty(&self) -> bool {
        if let Some(mut live) = self.live.try_lock() {
            self.merge_pending(&mut live);
            self.store_count(&live);
            return live.len() == 0;
        }

        self.live_count.load(Ordering::Acquire) == 0
            && self.subscribe_later.lock().is_empty()
            && self.subscribe_conditional_later.lock().is_empty()
    }

    /// Drop every callback; never blocks on a running `exec`
    ///
    /// While a dispatch is in progress the lists are cleared when it
    /// finishes, i.e. at the next merge.
    pub fn clear(&self) {
        self.try_clear(true, true);
    }

    fn try_clear(&self, plain: bool, conditional: bool) {
        match self.live.try_lock() {
            Some(mut live) => {
                if plain {
                    live.plain.clear();
                }
                if conditional {
                    live.conditional.clear();
                }
                self.store_count(&live);
            }
            None => {
                let mut pending = self.remove_later.lock();
                pending.clear_plain |= plain;
                pending.clear_conditional |= conditional;
            }
        }
    }

    fn merge_pending(&self, live: &mut Live<T>) {
        {
            let mut pending = self.remove_later.lock();
            if pending.clear_plain {
                live.plain.clear();
                pending.clear_plain = false;
            }
            if pending.clear_conditional {
                live.conditional.clear();
                pending.clear_conditional = false;
            }
            for handle in pending.handles.drain(..) {
                live.plain.retain(|(h, _)| *h != handle);
            }
        }

        live.plain.append(&mut self.subscribe_later.lock());
        live.conditional
            .append(&mut self.subscribe_conditional_later.lock());
        live.conditional.retain(|entry| !entry.is_done());
    }

    fn store_count(&self, live: &Live<T>) {
        self.live_count.store(live.len(), Ordering::Release);
    }
}

impl<T: Clone> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_exec_in_subscription_order() {
        let list: CallbackList<u32> = CallbackList::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            list.subscribe(move |value| seen.lock().push((tag, value)));
        }

        list.exec(7);
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let list: CallbackList<u32> = CallbackList::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&count);
        let handle = list.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        list.exec(1);
        list.unsubscribe(handle);
        list.exec(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(list.empty());
    }

    #[test]
    fn test_null_handle_is_ignored() {
        let list: CallbackList<u32> = CallbackList::new();
        list.subscribe(|_| {});
        list.unsubscribe(Handle::null());
        assert!(!list.empty());
    }

    #[test]
    fn test_unsubscribe_self_from_callback() {
        let list: Arc<CallbackList<u32>> = Arc::new(CallbackList::new());
        let count = Arc::new(AtomicU32::new(0));
        let own_handle: Arc<PlMutex<CallbackHandle<u32>>> = Arc::new(PlMutex::new(Handle::null()));

        let handle = {
            let list_ref = Arc::downgrade(&list);
            let count = Arc::clone(&count);
            let own_handle = Arc::clone(&own_handle);
            list.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(list) = list_ref.upgrade() {
                    list.unsubscribe(*own_handle.lock());
                }
            })
        };
        *own_handle.lock() = handle;

        list.exec(1);
        list.exec(2);
        list.exec(3);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(list.empty());
    }

    #[test]
    fn test_subscribe_from_callback_runs_next_time() {
        let list: Arc<CallbackList<u32>> = Arc::new(CallbackList::new());
        let late_calls = Arc::new(AtomicU32::new(0));
        let added = Arc::new(AtomicBool::new(false));

        {
            let list_ref = Arc::downgrade(&list);
            let late_calls = Arc::clone(&late_calls);
            let added = Arc::clone(&added);
            list.subscribe(move |_| {
                if added.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(list) = list_ref.upgrade() {
                    let late_calls = Arc::clone(&late_calls);
                    let handle = list.subscribe(move |_| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                    });
                    assert!(handle.valid());
                }
            });
        }

        list.exec(1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        list.exec(2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_then_unsubscribe_while_busy() {
        let list: Arc<CallbackList<u32>> = Arc::new(CallbackList::new());
        let late_calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicBool::new(false));

        {
            let list_ref = Arc::downgrade(&list);
            let late_calls = Arc::clone(&late_calls);
            let done = Arc::clone(&done);
            list.subscribe(move |_| {
                if done.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(list) = list_ref.upgrade() {
                    let late_calls = Arc::clone(&late_calls);
                    let handle = list.subscribe(move |_| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                    });
                    list.unsubscribe(handle);
                }
            });
        }

        list.exec(1);
        list.exec(2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_conditional_removed_after_true() {
        let list: CallbackList<u32> = CallbackList::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        list.subscribe_conditional(move |_| c.fetch_add(1, Ordering::SeqCst) + 1 == 3);

        for i in 0..6 {
            list.exec(i);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(list.empty());
    }

    #[test]
    fn test_conditional_runs_after_plain() {
        let list: CallbackList<u32> = CallbackList::new();
        let order = Arc::new(PlMutex::new(Vec::new()));

        let o = Arc::clone(&order);
        list.subscribe_conditional(move |_| {
            o.lock().push("conditional");
            false
        });
        let o = Arc::clone(&order);
        list.subscribe(move |_| o.lock().push("plain"));

        list.exec(0);
        assert_eq!(*order.lock(), vec!["plain", "conditional"]);
    }

    #[test]
    fn test_null_callback_clears_plain_only() {
        let list: CallbackList<u32> = CallbackList::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        list.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&calls);
        list.subscribe_conditional(move |_| {
            c.fetch_add(10, Ordering::SeqCst);
            false
        });

        let handle = list.subscribe_callback(None);
        assert!(!handle.valid());

        list.exec(0);
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        list.subscribe_conditional_callback(None);
        assert!(list.empty());
    }

    #[test]
    fn test_queue_hands_calls_to_executor() {
        let list: CallbackList<u32> = CallbackList::new();
        let sum = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let s = Arc::clone(&sum);
            list.subscribe(move |v| {
                s.fetch_add(v, Ordering::SeqCst);
            });
        }

        let queued = PlMutex::new(Vec::new());
        list.queue(5, |work| queued.lock().push(work));

        assert_eq!(sum.load(Ordering::SeqCst), 0);
        let work: Vec<QueuedCallback> = std::mem::take(&mut *queued.lock());
        assert_eq!(work.len(), 2);
        for w in work {
            w();
        }
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_queued_conditional_fires_once() {
        let list: CallbackList<u32> = CallbackList::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        list.subscribe_conditional(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });

        let queued = PlMutex::new(Vec::new());
        list.queue(1, |work| queued.lock().push(work));
        list.queue(2, |work| queued.lock().push(work));

        for w in std::mem::take(&mut *queued.lock()) {
            w();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(list.empty());
    }

    #[test]
    fn test_empty_and_clear_do_not_block_during_exec() {
        let list: Arc<CallbackList<u32>> = Arc::new(CallbackList::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = PlMutex::new(release_rx);

        list.subscribe(move |_| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
        });

        let runner = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.exec(0))
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!list.empty());
        list.clear();
        release_tx.send(()).unwrap();
        runner.join().unwrap();

        assert!(list.empty());
    }

    #[test]
    fn test_concurrent_subscribe_and_exec() {
        let list: Arc<CallbackList<u32>> = Arc::new(CallbackList::new());
        let calls = Arc::new(AtomicU32::new(0));

        let subscribers: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let calls = Arc::clone(&calls);
                        let handle = list.subscribe(move |_| {
                            calls.fetch_add(1, Ordering::Relaxed);
                        });
                        list.exec(0);
                        list.unsubscribe(handle);
                    }
                })
            })
            .collect();

        for s in subscribers {
            s.join().unwrap();
        }

        assert!(list.empty());
        assert!(calls.load(Ordering::Relaxed) >= 200);
    }
}
