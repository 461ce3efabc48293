//! Subscription / notification hub.
//!
//! Every subscription owns a bounded queue. Writers push samples into the
//! queues of the matching signal; consumers drain them either synchronously
//! (`try_drain`) or by awaiting `next`, which paces delivery so that no more
//! than one batch leaves per sampling interval. Samples arriving faster than
//! the consumer drains are coalesced by the queue's discard policy.

use crate::clock::Clock;
use crate::signal::{Sample, SignalKey};
use crate::store::TimeSeriesStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub type SubscriptionId = u64;

pub const DEFAULT_QUEUE_DEPTH: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Signal '{0}' is not registered")]
    UnknownSignal(String),
}

/// Requested monitoring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub sampling_interval_ms: u64,
    pub queue_depth: usize,
    pub discard_oldest: bool,
}

impl Default for SubscriptionParams {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 0,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            discard_oldest: true,
        }
    }
}

/// A batch handed to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subscription_id: SubscriptionId,
    pub signal: SignalKey,
    pub samples: Vec<Sample>,
    /// Set when samples were discarded or rejected since the previous drain.
    pub overflow: bool,
    pub dropped: u64,
}

#[derive(Debug)]
struct ItemQueue {
    samples: VecDeque<Sample>,
    overflow: bool,
    dropped: u64,
    last_activity_ms: u64,
    last_delivery: Option<Instant>,
}

#[derive(Debug)]
struct MonitoredItem {
    id: SubscriptionId,
    signal: SignalKey,
    params: SubscriptionParams,
    queue: Mutex<ItemQueue>,
    ready: Notify,
    closed: AtomicBool,
    /// Consumers currently parked in `next()`.
    waiters: AtomicUsize,
}

impl MonitoredItem {
    fn queue(&self) -> MutexGuard<'_, ItemQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue one sample; returns `false` when it was rejected.
    fn offer(&self, sample: Sample) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let accepted = {
            let mut queue = self.queue();
            if queue.samples.len() >= self.params.queue_depth {
                queue.overflow = true;
                queue.dropped += 1;
                if self.params.discard_oldest {
                    queue.samples.pop_front();
                    queue.samples.push_back(sample);
                    true
                } else {
                    false
                }
            } else {
                queue.samples.push_back(sample);
                true
            }
        };
        self.ready.notify_one();
        accepted
    }

    fn touch(&self, now_ms: u64) {
        self.queue().last_activity_ms = now_ms;
    }

    fn is_idle(&self, now_ms: u64, idle_timeout_ms: u64) -> bool {
        self.waiters.load(Ordering::Acquire) == 0
            && now_ms.saturating_sub(self.queue().last_activity_ms) > idle_timeout_ms
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    fn drain(&self, now_ms: u64) -> Option<Notification> {
        let mut queue = self.queue();
        queue.last_activity_ms = now_ms;
        if queue.samples.is_empty() {
            return None;
        }
        let samples: Vec<Sample> = queue.samples.drain(..).collect();
        let notification = Notification {
            subscription_id: self.id,
            signal: self.signal,
            samples,
            overflow: queue.overflow,
            dropped: queue.dropped,
        };
        queue.overflow = false;
        queue.dropped = 0;
        queue.last_delivery = Some(Instant::now());
        Some(notification)
    }
}

/// Marks a consumer as waiting in `next()`; a waiting consumer is never idle.
struct Waiting<'a> {
    handle: &'a SubscriptionHandle,
}

impl<'a> Waiting<'a> {
    fn new(handle: &'a SubscriptionHandle) -> Self {
        handle.item.waiters.fetch_add(1, Ordering::AcqRel);
        Self { handle }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.handle.item.touch(self.handle.now_ms());
        self.handle.item.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Consumer side of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    item: Arc<MonitoredItem>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.item.id
    }

    pub fn signal(&self) -> SignalKey {
        self.item.signal
    }

    /// Granted parameters; the sampling interval may have been raised to the
    /// signal's minimum.
    pub fn params(&self) -> SubscriptionParams {
        self.item.params
    }

    pub fn is_closed(&self) -> bool {
        self.item.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.item.queue().samples.len()
    }

    /// Values currently queued, oldest first, without consuming them.
    pub fn peek(&self) -> Vec<Sample> {
        self.item.queue().samples.iter().copied().collect()
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms().unwrap_or(0)
    }

    /// Takes everything queued right now, if anything.
    pub fn try_drain(&self) -> Option<Notification> {
        self.item.drain(self.now_ms())
    }

    /// Waits for the next batch. Returns `None` once the subscription is closed.
    /// The subscription counts as active for as long as the call is pending.
    pub async fn next(&self) -> Option<Notification> {
        let _waiting = Waiting::new(self);
        let interval = Duration::from_millis(self.item.params.sampling_interval_ms);
        loop {
            if self.is_closed() {
                return None;
            }

            let last_delivery = self.item.queue().last_delivery;
            if let Some(last) = last_delivery {
                let due = last + interval;
                if due > Instant::now() {
                    tokio::time::sleep_until(due).await;
                    continue;
                }
            }

            if let Some(notification) = self.try_drain() {
                return Some(notification);
            }
            self.item.ready.notified().await;
        }
    }
}

pub struct SubscriptionHub {
    store: Arc<TimeSeriesStore>,
    by_signal: HashMap<SignalKey, Mutex<Vec<Arc<MonitoredItem>>>>,
    by_id: Mutex<HashMap<SubscriptionId, Arc<MonitoredItem>>>,
    next_id: AtomicU64,
    idle_timeout_ms: u64,
}

impl SubscriptionHub {
    pub fn new(store: Arc<TimeSeriesStore>) -> Self {
        Self::with_idle_timeout(store, DEFAULT_IDLE_TIMEOUT_MS)
    }

    pub fn with_idle_timeout(store: Arc<TimeSeriesStore>, idle_timeout_ms: u64) -> Self {
        let by_signal = store
            .specs()
            .map(|spec| (spec.key, Mutex::new(Vec::new())))
            .collect();
        Self {
            store,
            by_signal,
            by_id: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout_ms,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Arc<MonitoredItem>>> {
        self.by_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        self.store.clock().now_ms().unwrap_or(0)
    }

    /// Registers interest in `signal`. The current value, when there is one,
    /// is queued immediately as the initial notification.
    pub fn subscribe(&self, signal: &str, params: SubscriptionParams) -> Result<SubscriptionHandle, HubError> {
        let spec = self
            .store
            .spec(signal)
            .ok_or_else(|| HubError::UnknownSignal(signal.to_string()))?;
        let subscribers = self
            .by_signal
            .get(signal)
            .ok_or_else(|| HubError::UnknownSignal(signal.to_string()))?;

        let granted = SubscriptionParams {
            sampling_interval_ms: params.sampling_interval_ms.max(spec.min_sampling_interval_ms),
            queue_depth: params.queue_depth.max(1),
            discard_oldest: params.discard_oldest,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(MonitoredItem {
            id,
            signal: spec.key,
            params: granted,
            queue: Mutex::new(ItemQueue {
                samples: VecDeque::with_capacity(granted.queue_depth),
                overflow: false,
                dropped: 0,
                last_activity_ms: self.now_ms(),
                last_delivery: None,
            }),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
        });

        // Publishers take the same lock, so no write can fall between the
        // initial value and the first queued change.
        {
            let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.store.read_latest(signal);
            if current.value.is_some() {
                item.offer(current);
            }
            subscribers.push(Arc::clone(&item));
        }
        self.registry().insert(id, Arc::clone(&item));

        info!(
            "Subscription {} created on {} (interval {} ms, depth {}, discard_oldest {})",
            id, spec.key, granted.sampling_interval_ms, granted.queue_depth, granted.discard_oldest
        );

        Ok(SubscriptionHandle {
            item,
            clock: Arc::clone(self.store.clock()),
        })
    }

    /// Stops delivery and releases the subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(item) = self.registry().remove(&id) else {
            return false;
        };
        if let Some(subscribers) = self.by_signal.get(item.signal.as_str()) {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|other| other.id != id);
        }
        item.close();
        info!("Subscription {} on {} removed", id, item.signal);
        true
    }

    /// Fans a freshly written sample out to the signal's subscribers.
    /// Returns how many queues accepted it.
    pub fn publish(&self, signal: &str, sample: Sample) -> usize {
        let Some(subscribers) = self.by_signal.get(signal) else {
            return 0;
        };
        let subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.iter().filter(|item| item.offer(sample)).count()
    }

    pub fn has_subscribers(&self, signal: &str) -> bool {
        self.by_signal
            .get(signal)
            .map(|subscribers| !subscribers.lock().unwrap_or_else(PoisonError::into_inner).is_empty())
            .unwrap_or(false)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry().len()
    }

    /// Tears down subscriptions nobody has drained or waited on within the
    /// idle timeout.
    pub fn reap_idle(&self) -> Vec<SubscriptionId> {
        let now_ms = self.now_ms();
        let expired: Vec<SubscriptionId> = self
            .registry()
            .values()
            .filter(|item| item.is_idle(now_ms, self.idle_timeout_ms))
            .map(|item| item.id)
            .collect();
        for id in &expired {
            debug!("Subscription {} idle for more than {} ms", id, self.idle_timeout_ms);
            self.unsubscribe(*id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::signal::{Quantity, SignalSpec, Value};

    fn hub() -> (Arc<TimeSeriesStore>, SubscriptionHub, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut store = TimeSeriesStore::new(clock.clone());
        store.register(SignalSpec::for_quantity("Device1", Quantity::Voltage, 100, 50).unwrap());
        let store = Arc::new(store);
        let hub = SubscriptionHub::with_idle_timeout(Arc::clone(&store), 5_000);
        (store, hub, clock)
    }

    fn sample(v: f64, ts: u64) -> Sample {
        Sample::good(Value::Double(v), ts, ts)
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let (_, hub, _) = hub();
        let err = hub.subscribe("Nope_Voltage", SubscriptionParams::default()).unwrap_err();
        assert_eq!(err, HubError::UnknownSignal("Nope_Voltage".to_string()));
    }

    #[test]
    fn test_sampling_interval_raised_to_minimum() {
        let (_, hub, _) = hub();
        let params = SubscriptionParams {
            sampling_interval_ms: 10,
            ..SubscriptionParams::default()
        };
        let handle = hub.subscribe("Device1_Voltage", params).unwrap();
        assert_eq!(handle.params().sampling_interval_ms, 100);
    }

    #[test]
    fn test_reject_newest_marks_overflow() {
        let (_, hub, _) = hub();
        let params = SubscriptionParams {
            sampling_interval_ms: 100,
            queue_depth: 2,
            discard_oldest: false,
        };
        let handle = hub.subscribe("Device1_Voltage", params).unwrap();
        for i in 0..4 {
            hub.publish("Device1_Voltage", sample(i as f64, i));
        }
        let notification = handle.try_drain().unwrap();
        assert_eq!(notification.samples.len(), 2);
        assert_eq!(notification.samples[0].value, Some(Value::Double(0.0)));
        assert!(notification.overflow);
        assert_eq!(notification.dropped, 2);

        hub.publish("Device1_Voltage", sample(9.0, 9));
        assert!(!handle.try_drain().unwrap().overflow);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let (_, hub, _) = hub();
        let handle = hub.subscribe("Device1_Voltage", SubscriptionParams::default()).unwrap();
        assert!(hub.unsubscribe(handle.id()));
        assert!(!hub.unsubscribe(handle.id()));
        assert!(handle.is_closed());
        assert_eq!(hub.publish("Device1_Voltage", sample(1.0, 1)), 0);
    }

    #[test]
    fn test_idle_subscriptions_reaped() {
        let (_, hub, clock) = hub();
        let idle = hub.subscribe("Device1_Voltage", SubscriptionParams::default()).unwrap();
        let active = hub.subscribe("Device1_Voltage", SubscriptionParams::default()).unwrap();
        clock.advance(4_000);
        active.try_drain();
        clock.advance(2_000);
        assert_eq!(hub.reap_idle(), vec![idle.id()]);
        assert!(idle.is_closed());
        assert!(!active.is_closed());
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_not_reaped() {
        let (_, hub, clock) = hub();
        let handle = hub.subscribe("Device1_Voltage", SubscriptionParams::default()).unwrap();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        clock.advance(6_000);
        assert!(hub.reap_idle().is_empty());
        assert_eq!(hub.publish("Device1_Voltage", sample(1.0, 7_000)), 1);
        let notification = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(notification.samples.len(), 1);

        // Idle time counts again from the end of the wait.
        clock.advance(4_000);
        assert!(hub.reap_idle().is_empty());
        clock.advance(2_000);
        assert_eq!(hub.reap_idle(), vec![handle.id()]);
    }

    #[test]
    fn test_initial_value_queued() {
        let (store, hub, _) = hub();
        store.write("Device1_Voltage", Value::Double(220.4), 900);
        let handle = hub.subscribe("Device1_Voltage", SubscriptionParams::default()).unwrap();
        assert_eq!(handle.pending(), 1);
    }
}
