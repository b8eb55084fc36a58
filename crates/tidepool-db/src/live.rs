//! # Live Views
//!
//! Continuously refreshed query results driven by an invalidation bus.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Live View Refresh                                │
//! │                                                                         │
//! │  LocalTable.put(..) ── commit ──► ChangeBus.publish("todos")           │
//! │                                         │ (tokio broadcast)             │
//! │                                         ▼                               │
//! │                              watcher task (one per view)                │
//! │                              watching {"todos"} ?                       │
//! │                                         │ yes                           │
//! │                                         ▼                               │
//! │                              recompute query once                       │
//! │                                         │                               │
//! │                      ┌──────────────────┼──────────────────┐            │
//! │                      ▼                  ▼                  ▼            │
//! │                 callback #1        callback #2        callback #3       │
//! │                                                                         │
//! │  First subscriber starts the watcher, last unsubscribe stops it.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriber lists use snapshot-on-notify: the lock is never held while a
//! callback runs, so callbacks may subscribe or unsubscribe freely.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::DbResult;

/// Default number of buffered invalidation events per receiver.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

// =============================================================================
// Change Bus
// =============================================================================

/// Invalidation signal: something in `table` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: String,
}

/// Broadcasts table-level invalidation events after commits.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<TableChange>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ChangeBus { tx }
    }

    /// Announces a change. A bus with no listeners drops the event.
    pub fn publish(&self, table: &str) {
        let _ = self.tx.send(TableChange {
            table: table.to_string(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.tx.subscribe()
    }

    /// Number of live receivers (watchers plus external listeners).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

// =============================================================================
// Live View
// =============================================================================

/// Type-erased async query.
pub type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, DbResult<T>> + Send + Sync>;

/// Subscriber callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

/// Subscribers and the watcher change together under one lock.
struct LiveState<T> {
    subscribers: Vec<Subscriber<T>>,
    watcher: Option<JoinHandle<()>>,
}

struct LiveInner<T> {
    bus: ChangeBus,
    tables: HashSet<String>,
    query: QueryFn<T>,
    state: Mutex<LiveState<T>>,
    next_id: AtomicU64,
}

/// A query whose result is pushed to subscribers whenever a watched table changes.
///
/// ## Example
/// ```rust,ignore
/// let view = db.table("todos")?.query().where_eq("done", false).live();
///
/// let sub = view.subscribe(|todos: &Vec<Record>| {
///     println!("{} open todos", todos.len());
/// }).await?;                 // prints immediately
///
/// todos.add(json!({"title": "new", "done": false})).await?;  // prints again
///
/// sub.unsubscribe();
/// ```
pub struct LiveView<T> {
    inner: Arc<LiveInner<T>>,
}

impl<T> Clone for LiveView<T> {
    fn clone(&self) -> Self {
        LiveView {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> LiveView<T> {
    /// Creates a view over `query`, refreshed when any of `tables` changes.
    pub fn new<F, Fut>(bus: ChangeBus, tables: impl IntoIterator<Item = impl Into<String>>, query: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<T>> + Send + 'static,
    {
        let query: QueryFn<T> = Arc::new(move || query().boxed());
        LiveView {
            inner: Arc::new(LiveInner {
                bus,
                tables: tables.into_iter().map(Into::into).collect(),
                query,
                state: Mutex::new(LiveState {
                    subscribers: Vec::new(),
                    watcher: None,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Runs the query once without subscribing.
    pub async fn current(&self) -> DbResult<T> {
        (self.inner.query)().await
    }

    /// Registers `callback` and invokes it immediately with the current value.
    ///
    /// A change committed while the initial query runs is delivered to the
    /// new subscriber once it is registered.
    ///
    /// ## Returns
    /// * `Ok(LiveSubscription)` - handle; dropping it unsubscribes
    /// * `Err(DbError)` - the initial query failed; nothing was registered
    pub async fn subscribe(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> DbResult<LiveSubscription> {
        let rx = self.inner.bus.subscribe();

        let value = self.current().await?;
        callback(&value);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let callback: Callback<T> = Arc::new(callback);

        // The first subscriber hands its receiver to a new watcher. Later
        // ones keep it to catch changes the running watcher sent before
        // they were registered.
        let missed = {
            let mut state = self.inner.state.lock();
            state.subscribers.push(Subscriber {
                id,
                active: Arc::clone(&active),
                callback: Arc::clone(&callback),
            });
            if state.watcher.is_none() {
                debug!(tables = ?self.inner.tables, "Starting live view watcher");
                state.watcher = Some(tokio::spawn(watch(Arc::downgrade(&self.inner), rx)));
                None
            } else {
                Some(rx)
            }
        };

        if let Some(mut rx) = missed {
            if self.inner.has_pending_change(&mut rx) {
                match self.current().await {
                    Ok(fresh) if active.load(Ordering::Acquire) => callback(&fresh),
                    Ok(_) => {}
                    Err(e) => warn!(?e, tables = ?self.inner.tables, "Live view catch-up failed"),
                }
            }
        }

        let inner: Arc<dyn Unsubscribe> = self.inner.clone();
        Ok(LiveSubscription {
            id,
            active,
            view: Arc::downgrade(&inner),
        })
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// True while a watcher task is running.
    pub fn is_watching(&self) -> bool {
        self.inner.state.lock().watcher.is_some()
    }
}

impl<T: Send + Sync + 'static> LiveInner<T> {
    async fn refresh(&self) {
        let value = match (self.query)().await {
            Ok(value) => value,
            Err(e) => {
                warn!(?e, tables = ?self.tables, "Live view recompute failed");
                return;
            }
        };

        let snapshot: Vec<(Arc<AtomicBool>, Callback<T>)> = self
            .state
            .lock()
            .subscribers
            .iter()
            .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
            .collect();

        for (active, callback) in snapshot {
            if active.load(Ordering::Acquire) {
                callback(&value);
            }
        }
    }

    /// Drains `rx`, reporting whether a watched table changed.
    fn has_pending_change(&self, rx: &mut broadcast::Receiver<TableChange>) -> bool {
        let mut changed = false;
        loop {
            match rx.try_recv() {
                Ok(change) => changed |= self.tables.contains(&change.table),
                Err(TryRecvError::Lagged(_)) => changed = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return changed,
            }
        }
    }
}

async fn watch<T: Send + Sync + 'static>(
    view: Weak<LiveInner<T>>,
    mut rx: broadcast::Receiver<TableChange>,
) {
    loop {
        let relevant = match rx.recv().await {
            Ok(change) => {
                let Some(inner) = view.upgrade() else { break };
                inner.tables.contains(&change.table)
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Live view lagged behind, recomputing");
                true
            }
            Err(RecvError::Closed) => break,
        };

        if !relevant {
            continue;
        }

        // Coalesce whatever is already queued into this recompute.
        loop {
            match rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let Some(inner) = view.upgrade() else { break };
        inner.refresh().await;
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<T: Send + Sync + 'static> Unsubscribe for LiveInner<T> {
    fn remove(&self, id: u64) {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| s.id != id);
        if state.subscribers.is_empty() {
            if let Some(handle) = state.watcher.take() {
                debug!(tables = ?self.tables, "Stopping live view watcher");
                handle.abort();
            }
        }
    }
}

/// Handle returned by [`LiveView::subscribe`].
///
/// Unsubscribing is idempotent and also happens on drop.
pub struct LiveSubscription {
    id: u64,
    active: Arc<AtomicBool>,
    view: Weak<dyn Unsubscribe>,
}

impl LiveSubscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(view) = self.view.upgrade() {
            view.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter_view(bus: &ChangeBus, source: Arc<AtomicUsize>) -> LiveView<usize> {
        LiveView::new(bus.clone(), ["todos"], move || {
            let source = Arc::clone(&source);
            async move { Ok(source.load(Ordering::SeqCst)) }
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_subscribe_emits_current_value_immediately() {
        let bus = ChangeBus::default();
        let source = Arc::new(AtomicUsize::new(7));
        let view = counter_view(&bus, source);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = view
            .subscribe(move |v: &usize| sink.lock().push(*v))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![7]);
        assert!(view.is_watching());
    }

    #[tokio::test]
    async fn test_refresh_on_watched_table_only() {
        let bus = ChangeBus::default();
        let source = Arc::new(AtomicUsize::new(1));
        let view = counter_view(&bus, Arc::clone(&source));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = view.subscribe(move |v: &usize| sink.lock().push(*v)).await.unwrap();

        bus.publish("other");
        settle().await;
        assert_eq!(*seen.lock(), vec![1]);

        source.store(2, Ordering::SeqCst);
        bus.publish("todos");
        settle().await;
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_watcher() {
        let bus = ChangeBus::default();
        let source = Arc::new(AtomicUsize::new(1));
        let view = counter_view(&bus, Arc::clone(&source));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = view
            .subscribe(move |_: &usize| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(view.subscriber_count(), 0);
        assert!(!view.is_watching());

        bus.publish("todos");
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watcher_is_reference_counted() {
        let bus = ChangeBus::default();
        let view = counter_view(&bus, Arc::new(AtomicUsize::new(0)));

        let a = view.subscribe(|_: &usize| {}).await.unwrap();
        let b = view.subscribe(|_: &usize| {}).await.unwrap();
        assert_eq!(view.subscriber_count(), 2);

        drop(a);
        assert!(view.is_watching());

        drop(b);
        assert!(!view.is_watching());

        // A fresh subscriber restarts the watcher.
        let _c = view.subscribe(|_: &usize| {}).await.unwrap();
        assert!(view.is_watching());
    }

    #[tokio::test]
    async fn test_late_subscriber_catches_change_during_initial_query() {
        let bus = ChangeBus::default();
        let source = Arc::new(AtomicUsize::new(1));
        let delay_ms = Arc::new(AtomicU64::new(0));
        let view = {
            let source = Arc::clone(&source);
            let delay_ms = Arc::clone(&delay_ms);
            LiveView::new(bus.clone(), ["todos"], move || {
                let source = Arc::clone(&source);
                let delay_ms = Arc::clone(&delay_ms);
                async move {
                    let value = source.load(Ordering::SeqCst);
                    let delay = delay_ms.load(Ordering::SeqCst);
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Ok(value)
                }
            })
        };

        let _first = view.subscribe(|_: &usize| {}).await.unwrap();
        assert!(view.is_watching());

        // The second subscriber's initial query reads 1, then stalls.
        delay_ms.store(100, Ordering::SeqCst);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let late_view = view.clone();
        let late = tokio::spawn(async move {
            late_view
                .subscribe(move |v: &usize| sink.lock().push(*v))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        delay_ms.store(10, Ordering::SeqCst);
        source.store(2, Ordering::SeqCst);
        bus.publish("todos");

        let _second = late.await.unwrap();
        settle().await;
        assert_eq!(seen.lock().first(), Some(&1));
        assert_eq!(seen.lock().last(), Some(&2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribe_and_unsubscribe_keep_a_watcher() {
        let bus = ChangeBus::default();
        let source = Arc::new(AtomicUsize::new(0));
        let view = counter_view(&bus, Arc::clone(&source));

        for _ in 0..50 {
            let churn = view.clone();
            let leaving = tokio::spawn(async move {
                let sub = churn.subscribe(|_: &usize| {}).await.unwrap();
                tokio::task::yield_now().await;
                drop(sub);
            });
            let staying = view.subscribe(|_: &usize| {}).await.unwrap();
            leaving.await.unwrap();

            assert_eq!(view.subscriber_count(), 1);
            assert!(view.is_watching());
            drop(staying);
            assert!(!view.is_watching());
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = view.subscribe(move |v: &usize| sink.lock().push(*v)).await.unwrap();
        source.store(5, Ordering::SeqCst);
        bus.publish("todos");
        settle().await;
        assert_eq!(seen.lock().last(), Some(&5));
    }
}
