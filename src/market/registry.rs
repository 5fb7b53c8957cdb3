use crate::market::supervisor::{
    supervise, ReconnectPolicy, StreamEvent, SupervisedLink, Supervisor,
};
use crate::market::transport::TransportFactory;
use crate::market::types::{ConnectionKey, ConnectionState, ConnectionStatusSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ConnectionRecord {
    generation: u64,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    next_generation: u64,
    records: HashMap<ConnectionKey, ConnectionRecord>,
    statuses: HashMap<ConnectionKey, ConnectionStatusSnapshot>,
}

impl RegistryInner {
    fn is_live(&self, key: &ConnectionKey, generation: u64) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.generation == generation)
    }

    /// Removes and cancels the record for `key`, optionally only when it
    /// still belongs to `generation`.
    fn take_live(
        &mut self,
        key: &ConnectionKey,
        generation: Option<u64>,
    ) -> Option<ConnectionRecord> {
        let owned = match (self.records.get(key), generation) {
            (Some(record), Some(generation)) => record.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !owned {
            return None;
        }

        let record = self.records.remove(key)?;
        record.cancellation_token.cancel();
        if key.is_transient() {
            self.statuses.remove(key);
            return Some(record);
        }
        let attempt = self.statuses.get(key).map_or(0, |status| status.attempt);
        self.statuses.insert(
            key.clone(),
            ConnectionStatusSnapshot {
                key: key.clone(),
                state: ConnectionState::Disconnected,
                attempt,
                reason: Some("stream closed by caller".to_string()),
            },
        );
        Some(record)
    }
}

/// Keyed set of supervised push connections. At most one live transport
/// exists per key; every record carries a generation so that a task belonging
/// to a closed or reopened key can tell it has been superseded.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `key`, closing any live connection already registered under it.
    /// Must be called from within a tokio runtime.
    pub fn open(
        &self,
        key: ConnectionKey,
        factory: Arc<dyn TransportFactory>,
        policy: ReconnectPolicy,
        buffer: usize,
    ) -> Subscription {
        let (events, receiver) = mpsc::channel(buffer.max(1));
        let cancellation_token = CancellationToken::new();

        let generation = {
            let mut inner = self.inner.lock();
            if let Some(previous) = inner.records.remove(&key) {
                debug!(key = %key, generation = previous.generation, "replacing live connection");
                previous.cancellation_token.cancel();
            }

            inner.next_generation += 1;
            let generation = inner.next_generation;
            let link = SupervisedLink {
                supervisor: Supervisor::new(key.clone(), policy),
                slot: RegistrySlot {
                    registry: Arc::downgrade(&self.inner),
                    key: key.clone(),
                    generation,
                },
                events,
                cancel: cancellation_token.clone(),
            };

            // Spawned under the lock so the task cannot release its slot
            // before the record exists.
            let join_handle = tokio::spawn(supervise(link, factory));
            inner.records.insert(
                key.clone(),
                ConnectionRecord {
                    generation,
                    cancellation_token,
                    join_handle,
                },
            );
            inner
                .statuses
                .insert(key.clone(), ConnectionStatusSnapshot::idle(key.clone()));
            generation
        };

        info!(key = %key, generation, "connection opened");
        Subscription {
            key,
            generation,
            events: receiver,
            registry: self.clone(),
        }
    }

    /// Stops the key immediately; pending reconnect timers become no-ops.
    pub fn close(&self, key: &ConnectionKey) -> bool {
        let closed = self.inner.lock().take_live(key, None).is_some();
        if closed {
            info!(key = %key, "connection closed");
        }
        closed
    }

    /// Closes `key` only if it is still owned by `generation`.
    pub fn close_generation(&self, key: &ConnectionKey, generation: u64) -> bool {
        let closed = self
            .inner
            .lock()
            .take_live(key, Some(generation))
            .is_some();
        if closed {
            info!(key = %key, generation, "connection closed");
        }
        closed
    }

    pub fn is_open(&self, key: &ConnectionKey) -> bool {
        self.inner.lock().records.contains_key(key)
    }

    pub fn status(&self, key: &ConnectionKey) -> Option<ConnectionStatusSnapshot> {
        self.inner.lock().statuses.get(key).cloned()
    }

    pub fn statuses(&self) -> Vec<ConnectionStatusSnapshot> {
        let mut statuses: Vec<ConnectionStatusSnapshot> =
            self.inner.lock().statuses.values().cloned().collect();
        statuses.sort_by(|left, right| left.key.cmp(&right.key));
        statuses
    }

    /// Closes every key and waits for the supervising tasks to finish.
    pub async fn shutdown(&self) {
        let records: Vec<(ConnectionKey, ConnectionRecord)> = {
            let mut inner = self.inner.lock();
            let keys: Vec<ConnectionKey> = inner.records.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| {
                    let record = inner.take_live(&key, None)?;
                    Some((key, record))
                })
                .collect()
        };

        for (key, record) in records {
            if let Err(error) = record.join_handle.await {
                debug!(key = %key, error = %error, "supervisor task ended abnormally");
            }
        }
    }
}

/// A supervising task's view of its own registry record.
#[derive(Clone)]
pub(crate) struct RegistrySlot {
    registry: Weak<Mutex<RegistryInner>>,
    key: ConnectionKey,
    generation: u64,
}

impl RegistrySlot {
    pub fn is_live(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let live = inner.lock().is_live(&self.key, self.generation);
        live
    }

    /// Stores the snapshot if this slot still owns the key.
    pub fn record_status(&self, snapshot: &ConnectionStatusSnapshot) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut inner = inner.lock();
        if !inner.is_live(&self.key, self.generation) {
            return false;
        }
        inner.statuses.insert(self.key.clone(), snapshot.clone());
        true
    }

    /// Drops the record once supervision has ended on its own. The last
    /// recorded status is kept for display, except for transient keys.
    pub fn release(&self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        if inner.is_live(&self.key, self.generation) {
            inner.records.remove(&self.key);
            if self.key.is_transient() {
                inner.statuses.remove(&self.key);
            }
            debug!(key = %self.key, generation = self.generation, "connection released");
        }
    }
}

/// Receiving end of one opened key. Dropping it closes the key, so no event is
/// delivered after teardown.
pub struct Subscription {
    key: ConnectionKey,
    generation: u64,
    events: mpsc::Receiver<StreamEvent>,
    registry: ConnectionRegistry,
}

impl Subscription {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next status change or frame, in transport order. `None` once the
    /// connection has settled or was closed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.events.close();
        self.registry.close_generation(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::transport::testing::{Script, ScriptedFactory};
    use crate::market::transport::TransportEvent;
    use crate::market::types::NORMAL_CLOSURE_CODE;
    use std::time::Duration;

    fn key() -> ConnectionKey {
        ConnectionKey::new("ohlc:BTCUSDT:1m")
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::fixed(max_attempts, Duration::from_millis(3_000))
    }

    async fn statuses_until_settled(
        subscription: &mut Subscription,
    ) -> Vec<ConnectionStatusSnapshot> {
        let mut statuses = Vec::new();
        while let Some(event) = subscription.next_event().await {
            if let StreamEvent::Status(status) = event {
                let settled = status.state.is_settled();
                statuses.push(status);
                if settled {
                    break;
                }
            }
        }
        statuses
    }

    async fn wait_for_state(subscription: &mut Subscription, state: ConnectionState) {
        while let Some(event) = subscription.next_event().await {
            if matches!(event, StreamEvent::Status(ref status) if status.state == state) {
                return;
            }
        }
        panic!("subscription ended before reaching {state:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_fail_exactly_at_ceiling() {
        let registry = ConnectionRegistry::new();
        let factory = ScriptedFactory::new(Vec::new());
        let mut subscription = registry.open(key(), Arc::new(factory.clone()), policy(3), 64);

        let statuses = statuses_until_settled(&mut subscription).await;

        assert_eq!(factory.connects(), 4);
        assert_eq!(statuses[0].state, ConnectionState::Connecting);
        assert_eq!(statuses[1].state, ConnectionState::Error);
        assert!(statuses[1]
            .reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("connect failed")));
        let last = statuses.last().expect("settled status");
        assert_eq!(last.state, ConnectionState::Failed);
        assert_eq!(
            statuses
                .iter()
                .filter(|status| status.state == ConnectionState::Reconnecting)
                .count(),
            3
        );

        assert!(subscription.next_event().await.is_none());
        assert!(!registry.is_open(&key()));
        assert_eq!(
            registry.status(&key()).map(|status| status.state),
            Some(ConnectionState::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connected_transition_resets_attempt_budget() {
        let registry = ConnectionRegistry::new();
        let factory = ScriptedFactory::new(vec![
            Script::Refuse("refused".to_string()),
            Script::Session(Vec::new()),
            Script::Refuse("refused".to_string()),
        ]);
        let mut subscription = registry.open(key(), Arc::new(factory.clone()), policy(2), 64);

        let statuses = statuses_until_settled(&mut subscription).await;

        assert_eq!(factory.connects(), 4);
        let reconnect_attempts: Vec<u32> = statuses
            .iter()
            .filter(|status| status.state == ConnectionState::Reconnecting)
            .map(|status| status.attempt)
            .collect();
        assert_eq!(reconnect_attempts, vec![1, 1, 2]);
        assert_eq!(
            statuses.last().map(|status| status.state),
            Some(ConnectionState::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn normal_closure_settles_without_retry() {
        let registry = ConnectionRegistry::new();
        let factory = ScriptedFactory::new(vec![Script::Session(vec![TransportEvent::Closed {
            code: NORMAL_CLOSURE_CODE,
            reason: None,
        }])]);
        let mut subscription = registry.open(key(), Arc::new(factory.clone()), policy(3), 64);

        let states: Vec<ConnectionState> = statuses_until_settled(&mut subscription)
            .await
            .into_iter()
            .map(|status| status.state)
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(factory.connects(), 1);
        assert!(subscription.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_turns_pending_reconnect_into_no_op() {
        let registry = ConnectionRegistry::new();
        let factory = ScriptedFactory::new(Vec::new());
        let mut subscription = registry.open(key(), Arc::new(factory.clone()), policy(3), 64);

        wait_for_state(&mut subscription, ConnectionState::Reconnecting).await;
        assert!(registry.close(&key()));
        assert!(!registry.close(&key()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(factory.connects(), 1);
        assert_eq!(
            registry.status(&key()).map(|status| status.state),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_closes_previous_connection_first() {
        let registry = ConnectionRegistry::new();
        let first_factory = ScriptedFactory::new(vec![Script::Hold(Vec::new())]);
        let second_factory = ScriptedFactory::new(vec![Script::Hold(Vec::new())]);

        let mut first = registry.open(key(), Arc::new(first_factory.clone()), policy(3), 64);
        wait_for_state(&mut first, ConnectionState::Connected).await;

        let mut second = registry.open(key(), Arc::new(second_factory.clone()), policy(3), 64);
        assert_ne!(first.generation(), second.generation());
        wait_for_state(&mut second, ConnectionState::Connected).await;

        while first.next_event().await.is_some() {}
        assert_eq!(first_factory.closes(), 1);

        drop(first);
        assert!(registry.is_open(&key()));
        assert_eq!(
            registry.status(&key()).map(|status| status.state),
            Some(ConnectionState::Connected)
        );
        assert_eq!(second_factory.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_arrive_in_transport_order() {
        let registry = ConnectionRegistry::new();
        let factory = ScriptedFactory::new(vec![Script::Hold(vec![
            TransportEvent::Message("1".to_string()),
            TransportEvent::Message("2".to_string()),
            TransportEvent::Message("3".to_string()),
        ])]);
        let mut subscription = registry.open(key(), Arc::new(factory), policy(3), 64);

        let mut frames = Vec::new();
        while frames.len() < 3 {
            match subscription.next_event().await {
                Some(StreamEvent::Frame(frame)) => frames.push(frame),
                Some(StreamEvent::Status(_)) => {}
                None => break,
            }
        }
        assert_eq!(frames, vec!["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_subscription_closes_transport() {
        let registry = ConnectionRegistry::new();
        let factory = ScriptedFactory::new(vec![Script::Hold(Vec::new())]);
        let mut subscription = registry.open(key(), Arc::new(factory.clone()), policy(3), 64);
        wait_for_state(&mut subscription, ConnectionState::Connected).await;

        drop(subscription);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(factory.closes(), 1);
        assert!(!registry.is_open(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_keys_leave_no_status_behind() {
        let registry = ConnectionRegistry::new();
        let settled_key = ConnectionKey::upload("UPLOAD:A");
        let factory = ScriptedFactory::new(vec![Script::Session(vec![TransportEvent::Closed {
            code: NORMAL_CLOSURE_CODE,
            reason: None,
        }])]);
        let mut settled = registry.open(
            settled_key.clone(),
            Arc::new(factory),
            ReconnectPolicy::disabled(),
            64,
        );
        statuses_until_settled(&mut settled).await;
        assert!(settled.next_event().await.is_none());
        assert!(!registry.is_open(&settled_key));
        assert_eq!(registry.status(&settled_key), None);

        let closed_key = ConnectionKey::upload("UPLOAD:B");
        let factory = ScriptedFactory::new(vec![Script::Hold(Vec::new())]);
        let mut closed = registry.open(
            closed_key.clone(),
            Arc::new(factory),
            ReconnectPolicy::disabled(),
            64,
        );
        wait_for_state(&mut closed, ConnectionState::Connected).await;
        assert!(registry.close(&closed_key));
        assert_eq!(registry.status(&closed_key), None);

        let factory = ScriptedFactory::new(Vec::new());
        let mut live = registry.open(key(), Arc::new(factory), policy(0), 64);
        statuses_until_settled(&mut live).await;
        let keys: Vec<ConnectionKey> =
            registry.statuses().into_iter().map(|status| status.key).collect();
        assert_eq!(keys, vec![key()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_every_task() {
        let registry = ConnectionRegistry::new();
        let factory =
            ScriptedFactory::new(vec![Script::Hold(Vec::new()), Script::Hold(Vec::new())]);
        let mut candles = registry.open(key(), Arc::new(factory.clone()), policy(3), 64);
        let mut alerts =
            registry.open(ConnectionKey::alerts(), Arc::new(factory.clone()), policy(3), 64);
        wait_for_state(&mut candles, ConnectionState::Connected).await;
        wait_for_state(&mut alerts, ConnectionState::Connected).await;

        registry.shutdown().await;

        assert_eq!(factory.closes(), 2);
        let states: Vec<ConnectionState> =
            registry.statuses().into_iter().map(|status| status.state).collect();
        assert_eq!(
            states,
            vec![ConnectionState::Disconnected, ConnectionState::Disconnected]
        );
    }
}
