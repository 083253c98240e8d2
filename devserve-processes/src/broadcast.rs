//! Per-owner log fan-out with a bounded replay buffer.
//!
//! Delivery contract: every append is offered to each subscriber in
//! registration order, one at a time. A subscriber that is closed, or that
//! does not accept the event within the delivery timeout, is dropped from the
//! set and reported as [`Delivery::Dropped`]. Dropping one subscriber never
//! affects delivery to the others or the caller of `append`.
//!
//! Output events are retained in a FIFO of fixed capacity. Status events
//! replace the owner's current status. Both are replayed to a new subscriber
//! before it can observe any live event, so a late joiner sees a continuous
//! stream without gaps or reordering.

use async_trait::async_trait;
use devserve_core::{DevServeConfig, OwnerId};
use miette::Diagnostic;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::LogEvent;

pub const DEFAULT_REPLAY_CAPACITY: usize = 200;
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of the replay size for channels created by `subscribe_channel`,
/// so live events can queue while the receiver catches up.
const LIVE_HEADROOM: usize = 64;

#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber channel is closed")]
    Closed,
}

/// A live delivery channel for one subscriber.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, event: &LogEvent) -> Result<(), DeliveryError>;
}

#[async_trait]
impl Subscriber for mpsc::Sender<LogEvent> {
    async fn deliver(&self, event: &LogEvent) -> Result<(), DeliveryError> {
        self.send(event.clone())
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Closed,
    TimedOut,
}

/// Result of offering one event to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped(DropReason),
}

struct OwnerLog {
    history: VecDeque<LogEvent>,
    status: LogEvent,
    /// Stamp of the last status accepted by `append_status`
    status_seq: u64,
    subscribers: Vec<(SubscriberId, Arc<dyn Subscriber>)>,
}

impl OwnerLog {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            status: LogEvent::stopped(),
            status_seq: 0,
            subscribers: Vec::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.subscribers.is_empty()
            && self.history.is_empty()
            && self.status == LogEvent::stopped()
            && self.status_seq == 0
    }
}

type OwnerLogs = HashMap<OwnerId, Arc<tokio::sync::Mutex<OwnerLog>>>;

pub struct Broadcaster {
    /// The outer lock only guards the map and is never held across `.await`;
    /// each owner's log is serialized by its own async lock.
    owners: Mutex<OwnerLogs>,
    capacity: usize,
    delivery_timeout: Duration,
    next_id: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY, DEFAULT_DELIVERY_TIMEOUT)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize, delivery_timeout: Duration) -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            capacity,
            delivery_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &DevServeConfig) -> Self {
        Self::new(config.replay_capacity, config.delivery_timeout)
    }

    fn lock_owners(&self) -> std::sync::MutexGuard<'_, OwnerLogs> {
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_for(&self, owner: &OwnerId) -> Arc<tokio::sync::Mutex<OwnerLog>> {
        self.lock_owners()
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(OwnerLog::new())))
            .clone()
    }

    fn existing_log(&self, owner: &OwnerId) -> Option<Arc<tokio::sync::Mutex<OwnerLog>>> {
        self.lock_owners().get(owner).cloned()
    }

    /// Drop the owner's entry if nothing references it and it holds no state.
    fn prune(&self, owner: &OwnerId, log: &Arc<tokio::sync::Mutex<OwnerLog>>, idle: bool) {
        if !idle {
            return;
        }
        let mut owners = self.lock_owners();
        // Clones are only taken under the map lock: the map plus our handle
        // means no other task can be waiting on this log.
        if Arc::strong_count(log) == 2
            && owners.get(owner).is_some_and(|current| Arc::ptr_eq(current, log))
        {
            owners.remove(owner);
            debug!("Pruned idle log state for {}", owner);
        }
    }

    async fn offer(&self, subscriber: &dyn Subscriber, event: &LogEvent) -> Delivery {
        match tokio::time::timeout(self.delivery_timeout, subscriber.deliver(event)).await {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(DeliveryError::Closed)) => Delivery::Dropped(DropReason::Closed),
            Err(_) => Delivery::Dropped(DropReason::TimedOut),
        }
    }

    /// Record `event` for `owner` and deliver it to every current subscriber.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub async fn append(&self, owner: &OwnerId, event: LogEvent) -> usize {
        let log = self.log_for(owner);
        let mut state = log.lock().await;
        self.record_and_deliver(owner, &mut state, event).await
    }

    /// Append a status change stamped with `seq`.
    ///
    /// Stamps must follow the order in which the changes happened. A status
    /// older than the last one accepted is ignored and `None` is returned. An
    /// accepted `Stopped` status also forgets the retained output.
    pub async fn append_status(&self, owner: &OwnerId, event: LogEvent, seq: u64) -> Option<usize> {
        let log = self.log_for(owner);
        let mut state = log.lock().await;
        if seq <= state.status_seq {
            debug!("Ignoring stale status for {}: {:?}", owner, event);
            return None;
        }
        state.status_seq = seq;

        let stopped = event == LogEvent::stopped();
        let delivered = self.record_and_deliver(owner, &mut state, event).await;
        if stopped {
            state.history.clear();
        }
        Some(delivered)
    }

    async fn record_and_deliver(&self, owner: &OwnerId, state: &mut OwnerLog, event: LogEvent) -> usize {
        match &event {
            LogEvent::Output { .. } => {
                state.history.push_back(event.clone());
                while state.history.len() > self.capacity {
                    state.history.pop_front();
                }
            }
            LogEvent::Status { .. } => state.status = event.clone(),
            LogEvent::Error { .. } => {}
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            match self.offer(subscriber.as_ref(), &event).await {
                Delivery::Delivered => delivered += 1,
                Delivery::Dropped(reason) => {
                    warn!("Dropping subscriber {:?} of {}: {:?}", id, owner, reason);
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            state.subscribers.retain(|(id, _)| !dropped.contains(id));
        }
        delivered
    }

    /// Register `subscriber` for `owner`, replaying the current status and the
    /// retained output before any later event.
    ///
    /// A subscriber that fails during replay is not registered.
    pub async fn subscribe(&self, owner: &OwnerId, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let log = self.log_for(owner);
        let mut state = log.lock().await;

        let replay = std::iter::once(&state.status).chain(state.history.iter());
        for event in replay {
            if let Delivery::Dropped(reason) = self.offer(subscriber.as_ref(), event).await {
                warn!(
                    "Subscriber {:?} of {} failed during replay: {:?}",
                    id, owner, reason
                );
                return id;
            }
        }

        state.subscribers.push((id, subscriber));
        debug!("Subscriber {:?} attached to {}", id, owner);
        id
    }

    /// Subscribe through a fresh channel sized to hold the full replay.
    pub async fn subscribe_channel(
        &self,
        owner: &OwnerId,
    ) -> (SubscriberId, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity + 1 + LIVE_HEADROOM);
        let id = self.subscribe(owner, Arc::new(tx)).await;
        (id, rx)
    }

    /// Remove a subscriber. Retained output survives until `clear_history`.
    pub async fn unsubscribe(&self, owner: &OwnerId, id: SubscriberId) -> bool {
        let Some(log) = self.existing_log(owner) else {
            return false;
        };
        let (removed, idle) = {
            let mut state = log.lock().await;
            let before = state.subscribers.len();
            state.subscribers.retain(|(sub, _)| *sub != id);
            (state.subscribers.len() != before, state.is_idle())
        };
        self.prune(owner, &log, idle);
        removed
    }

    /// Forget retained output for `owner`, e.g. once its server has stopped.
    pub async fn clear_history(&self, owner: &OwnerId) {
        let Some(log) = self.existing_log(owner) else {
            return;
        };
        let idle = {
            let mut state = log.lock().await;
            state.history.clear();
            state.is_idle()
        };
        self.prune(owner, &log, idle);
    }

    /// Retained output for `owner`, oldest first.
    pub async fn history(&self, owner: &OwnerId) -> Vec<LogEvent> {
        match self.existing_log(owner) {
            Some(log) => log.lock().await.history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The last status event appended for `owner`.
    pub async fn status(&self, owner: &OwnerId) -> LogEvent {
        match self.existing_log(owner) {
            Some(log) => log.lock().await.status.clone(),
            None => LogEvent::stopped(),
        }
    }

    pub async fn subscriber_count(&self, owner: &OwnerId) -> usize {
        match self.existing_log(owner) {
            Some(log) => log.lock().await.subscribers.len(),
            None => 0,
        }
    }
}
