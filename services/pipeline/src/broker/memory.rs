//! In-process broker with the delivery semantics of each real backend.
//!
//! One [`MemoryBus`] holds any number of queues. Brokers handed out by
//! [`MemoryBus::broker`] share it, so a producer and several consumers can
//! be wired together in one test. [`MemoryBus::expire_consumer`] stands in
//! for a consumer process dying without acknowledging what it holds.

use super::offsets::PartitionProgress;
use super::{Broker, BrokerError, Delivery, DeliveryHandle, HandleKind, Role};
use crate::task::TaskRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Which real backend a [`MemoryBroker`] imitates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySemantics {
    /// Move-on-read into a per-consumer holding list
    List,
    /// Consumer group with pending entries; entries idle for `claim_idle`
    /// may be claimed by any member
    Stream { claim_idle: Duration },
    /// Partitioned log with committed offsets per group
    Log { partitions: usize },
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    notify: Notify,
}

#[derive(Default)]
struct BusState {
    lists: HashMap<String, ListQueue>,
    streams: HashMap<String, StreamLog>,
    logs: HashMap<String, PartitionedLog>,
}

#[derive(Default)]
struct ListQueue {
    ready: VecDeque<String>,
    holding: HashMap<String, VecDeque<String>>,
}

impl ListQueue {
    fn take(&mut self, consumer: &str) -> Option<String> {
        let raw = self.ready.pop_front()?;
        self.holding
            .entry(consumer.to_string())
            .or_default()
            .push_back(raw.clone());
        Some(raw)
    }

    /// Drop `raw` from the consumer's holding list, reporting whether it was held
    fn unhold(&mut self, consumer: &str, raw: &str) -> bool {
        let Some(held) = self.holding.get_mut(consumer) else {
            return false;
        };
        match held.iter().position(|entry| entry == raw) {
            Some(pos) => {
                held.remove(pos);
                true
            }
            None => false,
        }
    }

    fn requeue(&mut self, consumer: &str) -> usize {
        let held = self.holding.remove(consumer).unwrap_or_default();
        let count = held.len();
        self.ready.extend(held);
        count
    }
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<(u64, TaskRecord)>,
    last_id: u64,
    groups: HashMap<String, StreamGroup>,
}

impl StreamLog {
    fn record(&self, id: u64) -> Option<TaskRecord> {
        self.entries
            .binary_search_by_key(&id, |(entry_id, _)| *entry_id)
            .ok()
            .map(|idx| self.entries[idx].1.clone())
    }
}

#[derive(Default)]
struct StreamGroup {
    next_index: usize,
    pending: BTreeMap<u64, PendingEntry>,
}

impl StreamGroup {
    /// Next own pending entry after `after`, advancing the cursor
    fn reread(&self, consumer: &str, after: &mut Option<u64>) -> Option<u64> {
        let from = (*after)?;
        let own = self
            .pending
            .range(from + 1..)
            .find(|(_, entry)| entry.consumer == consumer)
            .map(|(id, _)| *id);
        *after = own;
        own
    }

    fn claimable(&self, now: Instant, claim_idle: Duration) -> Option<u64> {
        self.pending
            .iter()
            .find(|(_, entry)| entry.abandoned || now.duration_since(entry.delivered_at) >= claim_idle)
            .map(|(id, _)| *id)
    }

    fn assign(&mut self, id: u64, consumer: &str, now: Instant) {
        self.pending.insert(
            id,
            PendingEntry {
                consumer: consumer.to_string(),
                delivered_at: now,
                abandoned: false,
            },
        );
    }
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    abandoned: bool,
}

struct PartitionedLog {
    partitions: Vec<Vec<String>>,
    groups: HashMap<String, LogGroup>,
}

impl PartitionedLog {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions.max(1)],
            groups: HashMap::new(),
        }
    }

    fn group(&mut self, name: &str) -> &mut LogGroup {
        let count = self.partitions.len();
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| LogGroup::new(count))
    }
}

struct LogGroup {
    committed: Vec<i64>,
    leases: Vec<Option<String>>,
    positions: Vec<i64>,
    progress: Vec<PartitionProgress>,
}

impl LogGroup {
    fn new(partitions: usize) -> Self {
        Self {
            committed: vec![0; partitions],
            leases: vec![None; partitions],
            positions: vec![0; partitions],
            progress: vec![PartitionProgress::default(); partitions],
        }
    }

    fn holds(&self, partition: usize, consumer: &str) -> bool {
        self.leases.get(partition).and_then(|l| l.as_deref()) == Some(consumer)
    }

    /// Next offset for `consumer`, leasing a free partition with backlog if needed
    fn take(&mut self, consumer: &str, lengths: &[usize]) -> Option<(usize, i64)> {
        for (p, len) in lengths.iter().enumerate() {
            let len = *len as i64;
            if self.leases[p].is_none() && self.committed[p] < len {
                self.leases[p] = Some(consumer.to_string());
                self.positions[p] = self.committed[p];
            }
            if self.holds(p, consumer) && self.positions[p] < len {
                let offset = self.positions[p];
                self.positions[p] += 1;
                self.progress[p].delivered(offset);
                return Some((p, offset));
            }
        }
        None
    }

    fn release_leases(&mut self, consumer: &str) {
        for p in 0..self.leases.len() {
            if self.holds(p, consumer) {
                self.leases[p] = None;
                self.positions[p] = self.committed[p];
                self.progress[p].reset();
            }
        }
    }
}

impl BusState {
    fn list(&mut self, queue: &str) -> &mut ListQueue {
        self.lists.entry(queue.to_string()).or_default()
    }

    fn stream(&mut self, queue: &str) -> &mut StreamLog {
        self.streams.entry(queue.to_string()).or_default()
    }

    fn log(&mut self, queue: &str, partitions: usize) -> &mut PartitionedLog {
        self.logs
            .entry(queue.to_string())
            .or_insert_with(|| PartitionedLog::new(partitions))
    }

    fn log_group(&mut self, queue: &str, group: &str) -> Option<&mut LogGroup> {
        self.logs.get_mut(queue)?.groups.get_mut(group)
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    // FNV-1a; stable across runs
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
        (acc ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    });
    (hash % partitions.max(1) as u64) as usize
}

fn stream_id(id: u64) -> String {
    format!("{}-0", id)
}

fn parse_stream_id(raw: &str) -> Result<u64, BrokerError> {
    raw.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .ok_or_else(|| BrokerError::Protocol(format!("invalid stream id {}", raw)))
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker on `queue` with the given semantics. `group` is ignored by
    /// list semantics.
    pub fn broker(
        &self,
        semantics: MemorySemantics,
        queue: &str,
        role: Role,
        group: &str,
        consumer: &str,
    ) -> MemoryBroker {
        MemoryBroker {
            bus: self.clone(),
            semantics,
            queue: queue.to_string(),
            role,
            group: group.to_string(),
            consumer: consumer.to_string(),
            connected: false,
            reread_after: None,
        }
    }

    /// Treat `consumer` as crashed: whatever it holds becomes deliverable to
    /// the rest of its group.
    pub fn expire_consumer(&self, consumer: &str) {
        {
            let mut state = self.shared.state.lock();
            for queue in state.lists.values_mut() {
                queue.requeue(consumer);
            }
            for stream in state.streams.values_mut() {
                for group in stream.groups.values_mut() {
                    for entry in group.pending.values_mut() {
                        if entry.consumer == consumer {
                            entry.abandoned = true;
                        }
                    }
                }
            }
            for log in state.logs.values_mut() {
                for group in log.groups.values_mut() {
                    group.release_leases(consumer);
                }
            }
        }
        debug!(consumer = consumer, "Expired memory consumer");
        self.shared.notify.notify_waiters();
    }

    /// Messages on `queue` that no group has finished with yet
    pub fn outstanding(&self, queue: &str) -> usize {
        let state = self.shared.state.lock();
        let mut total = 0;

        if let Some(list) = state.lists.get(queue) {
            total += list.ready.len() + list.holding.values().map(VecDeque::len).sum::<usize>();
        }
        if let Some(stream) = state.streams.get(queue) {
            total += if stream.groups.is_empty() {
                stream.entries.len()
            } else {
                stream
                    .groups
                    .values()
                    .map(|g| stream.entries.len() - g.next_index + g.pending.len())
                    .sum()
            };
        }
        if let Some(log) = state.logs.get(queue) {
            let published: usize = log.partitions.iter().map(Vec::len).sum();
            total += if log.groups.is_empty() {
                published
            } else {
                log.groups
                    .values()
                    .map(|g| {
                        log.partitions
                            .iter()
                            .zip(&g.committed)
                            .map(|(p, c)| p.len() - *c as usize)
                            .sum::<usize>()
                    })
                    .sum()
            };
        }

        total
    }
}

pub struct MemoryBroker {
    bus: MemoryBus,
    semantics: MemorySemantics,
    queue: String,
    role: Role,
    group: String,
    consumer: String,
    connected: bool,
    /// Stream only: while set, own pending entries after this id are re-read
    reread_after: Option<u64>,
}

impl MemoryBroker {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn ensure_consumer(&self) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        match self.role {
            Role::Consumer => Ok(()),
            Role::Producer => Err(BrokerError::Unsupported(
                "producer-role broker cannot consume".to_string(),
            )),
        }
    }

    fn try_take(&mut self) -> Option<Delivery> {
        let shared = self.bus.shared.clone();
        let mut state = shared.state.lock();

        match self.semantics {
            MemorySemantics::List => {
                let raw = state.list(&self.queue).take(&self.consumer)?;
                Some(Delivery {
                    record: TaskRecord::from_json(raw.as_bytes()),
                    handle: DeliveryHandle::list_entry(raw),
                })
            }
            MemorySemantics::Stream { claim_idle } => self.take_stream(&mut state, claim_idle),
            MemorySemantics::Log { partitions } => {
                let log = state.log(&self.queue, partitions);
                let lengths: Vec<usize> = log.partitions.iter().map(Vec::len).collect();
                let (p, offset) = log.group(&self.group).take(&self.consumer, &lengths)?;
                Some(Delivery {
                    record: TaskRecord::from_json(log.partitions[p][offset as usize].as_bytes()),
                    handle: DeliveryHandle::log_offset(self.queue.clone(), p as i32, offset),
                })
            }
        }
    }

    /// Own pending entries first when re-reading, then idle or abandoned
    /// entries of any member, then new entries.
    fn take_stream(&mut self, state: &mut BusState, claim_idle: Duration) -> Option<Delivery> {
        let now = Instant::now();
        let stream = state.stream(&self.queue);
        let group = stream.groups.entry(self.group.clone()).or_default();

        let id = match group
            .reread(&self.consumer, &mut self.reread_after)
            .or_else(|| group.claimable(now, claim_idle))
        {
            Some(id) => id,
            None if group.next_index < stream.entries.len() => {
                let id = stream.entries[group.next_index].0;
                group.next_index += 1;
                id
            }
            None => return None,
        };
        group.assign(id, &self.consumer, now);

        Some(Delivery {
            handle: DeliveryHandle::stream_entry(stream_id(id)),
            record: Ok(stream.record(id)?),
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn backend(&self) -> &'static str {
        match self.semantics {
            MemorySemantics::List => "memory_list",
            MemorySemantics::Stream { .. } => "memory_stream",
            MemorySemantics::Log { .. } => "memory_log",
        }
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.connected {
            return Ok(());
        }

        if self.role == Role::Consumer {
            let mut state = self.bus.shared.state.lock();
            match self.semantics {
                MemorySemantics::List => {
                    let requeued = state.list(&self.queue).requeue(&self.consumer);
                    if requeued > 0 {
                        debug!(consumer = %self.consumer, requeued, "Requeued held entries");
                    }
                }
                MemorySemantics::Stream { .. } => {
                    state.stream(&self.queue).groups.entry(self.group.clone()).or_default();
                    self.reread_after = Some(0);
                }
                MemorySemantics::Log { partitions } => {
                    state.log(&self.queue, partitions).group(&self.group);
                }
            }
        }

        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, key: &str, record: &TaskRecord) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        {
            let mut state = self.bus.shared.state.lock();
            match self.semantics {
                MemorySemantics::List => state.list(&self.queue).ready.push_back(record.to_json()),
                MemorySemantics::Stream { .. } => {
                    let stream = state.stream(&self.queue);
                    stream.last_id += 1;
                    let id = stream.last_id;
                    stream.entries.push((id, record.clone()));
                }
                MemorySemantics::Log { partitions } => {
                    let log = state.log(&self.queue, partitions);
                    let p = partition_for(key, log.partitions.len());
                    log.partitions[p].push(record.to_json());
                }
            }
        }

        self.bus.shared.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_consumer()?;
        let deadline = Instant::now() + timeout;

        loop {
            let shared = self.bus.shared.clone();
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_take());
            }
        }
    }

    async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        self.ensure_consumer()?;
        let mut state = self.bus.shared.state.lock();

        match (&handle.kind, self.semantics) {
            (HandleKind::ListEntry { raw }, MemorySemantics::List) => {
                state.list(&self.queue).unhold(&self.consumer, raw);
                Ok(())
            }
            (HandleKind::StreamEntry { id }, MemorySemantics::Stream { .. }) => {
                let id = parse_stream_id(id)?;
                if let Some(group) = state.stream(&self.queue).groups.get_mut(&self.group) {
                    group.pending.remove(&id);
                }
                Ok(())
            }
            (HandleKind::LogOffset { partition, offset, .. }, MemorySemantics::Log { .. }) => {
                let group = state
                    .log_group(&self.queue, &self.group)
                    .ok_or(BrokerError::NotConnected)?;
                let p = *partition as usize;
                if !group.holds(p, &self.consumer) {
                    return Err(BrokerError::Protocol(format!(
                        "partition {} is not assigned to {}",
                        partition, self.consumer
                    )));
                }
                match group.progress[p].acknowledged(*offset) {
                    Some(position) => {
                        group.progress[p].committed(position);
                        group.committed[p] = group.committed[p].max(position);
                    }
                    None => debug!(
                        partition,
                        offset,
                        unresolved = group.progress[p].unresolved(),
                        "Commit waits for an earlier offset"
                    ),
                }
                Ok(())
            }
            _ => Err(handle.mismatch(self.backend())),
        }
    }

    async fn release(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        self.ensure_consumer()?;

        {
            let mut state = self.bus.shared.state.lock();
            match (&handle.kind, self.semantics) {
                (HandleKind::ListEntry { raw }, MemorySemantics::List) => {
                    let queue = state.list(&self.queue);
                    if queue.unhold(&self.consumer, raw) {
                        queue.ready.push_front(raw.clone());
                    }
                }
                (HandleKind::StreamEntry { .. }, MemorySemantics::Stream { .. }) => {
                    // Still pending for us; re-read on the next receive.
                    self.reread_after = Some(0);
                }
                (HandleKind::LogOffset { partition, offset, .. }, MemorySemantics::Log { .. }) => {
                    if let Some(group) = state.log_group(&self.queue, &self.group) {
                        let p = *partition as usize;
                        if group.holds(p, &self.consumer) {
                            group.positions[p] = group.positions[p].min(*offset);
                        }
                    }
                }
                _ => return Err(handle.mismatch(self.backend())),
            }
        }

        self.bus.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        if self.role == Role::Consumer {
            if let MemorySemantics::Log { .. } = self.semantics {
                if let Some(group) = self.bus.shared.state.lock().log_group(&self.queue, &self.group) {
                    group.release_leases(&self.consumer);
                }
            }
            self.bus.shared.notify.notify_waiters();
        }

        Ok(())
    }
}
