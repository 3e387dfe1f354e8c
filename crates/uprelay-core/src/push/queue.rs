//! Per-client message queues held by the push server.
//!
//! Each registered server id owns a [`ClientQueue`]. Ingestion and draining
//! take the same per-queue mutex, so a drain never observes half of a push.
//! Waiting delivery handlers are woken through a [`Notify`] instead of
//! polling on a fixed sleep.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

use crate::ids::ServerId;

/// A message waiting to be delivered to a client.
#[derive(Debug, Clone)]
pub struct PushItem {
    pub payload: Bytes,
    pub created: SystemTime,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PushItem>,
    last_poll: Option<SystemTime>,
    closed: bool,
}

/// Pending messages for one server id.
#[derive(Debug)]
pub struct ClientQueue {
    id: ServerId,
    created: SystemTime,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ClientQueue {
    fn new(id: ServerId) -> Self {
        Self {
            id,
            created: SystemTime::now(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Append a payload and wake every handler waiting on this queue.
    pub fn push(&self, payload: Bytes) {
        self.lock().items.push_back(PushItem {
            payload,
            created: SystemTime::now(),
        });
        self.notify.notify_waiters();
    }

    /// Take the oldest item, recording the poll.
    pub fn pop(&self) -> Option<PushItem> {
        let mut state = self.lock();
        state.last_poll = Some(SystemTime::now());
        state.items.pop_front()
    }

    /// Take up to `max` queued items in FIFO order, recording the poll.
    ///
    /// Items are gone from the queue once this returns, whether or not the
    /// caller manages to deliver them.
    pub fn drain(&self, max: usize) -> Vec<PushItem> {
        let mut state = self.lock();
        state.last_poll = Some(SystemTime::now());
        let n = max.min(state.items.len());
        state.items.drain(..n).collect()
    }

    /// Record a poll without taking anything.
    pub fn touch(&self) {
        self.lock().last_poll = Some(SystemTime::now());
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_poll(&self) -> Option<SystemTime> {
        self.lock().last_poll
    }

    /// Last time a client polled this queue, or its creation time.
    pub fn last_activity(&self) -> SystemTime {
        self.last_poll().unwrap_or(self.created)
    }

    /// Whether the record has been removed from the server.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Future resolving on the next push or close.
    ///
    /// Call [`Notified::enable`] before inspecting the queue so that a push
    /// landing in between is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// All client queues known to the server, keyed by server id.
#[derive(Debug)]
pub struct QueueMap {
    records: RwLock<HashMap<ServerId, Arc<ClientQueue>>>,
    id_length: usize,
}

impl QueueMap {
    pub fn new(id_length: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            id_length,
        }
    }

    /// Allocate a fresh server id with an empty queue.
    ///
    /// Collisions with live ids are retried under the write lock.
    pub fn register(&self) -> ServerId {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = ServerId::generate(self.id_length);
            if records.contains_key(&id) {
                debug!(id = %id, "Server id collision, retrying");
                continue;
            }
            records.insert(id.clone(), Arc::new(ClientQueue::new(id.clone())));
            return id;
        }
    }

    pub fn get(&self, id: &ServerId) -> Option<Arc<ClientQueue>> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.get(id).is_some()
    }

    /// Drop a record. Handlers still streaming from it are woken and stop.
    pub fn remove(&self, id: &ServerId) -> bool {
        let removed = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Look up every id, splitting them into found queues and unknown ids.
    pub fn get_many(&self, ids: &[ServerId]) -> (Vec<Arc<ClientQueue>>, Vec<ServerId>) {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match records.get(id) {
                Some(queue) => found.push(Arc::clone(queue)),
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    /// Remove records idle for longer than `ttl` as of `now`.
    pub fn sweep_expired(&self, ttl: Duration, now: SystemTime) -> Vec<ServerId> {
        let expired: Vec<ServerId> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|q| {
                now.duration_since(q.last_activity())
                    .map(|idle| idle > ttl)
                    .unwrap_or(false)
            })
            .map(|q| q.id().clone())
            .collect();

        for id in &expired {
            self.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
