// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Registry of per-shuffle state.
//!
//! All maps keyed by shuffle id live here; handlers reach them through
//! narrow methods only. Per-shuffle synchronization is carried by inner
//! fields of [`ShuffleState`] so no handler ever holds a registry-wide lock
//! across a suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};

use riffle_core::messages::{ChangeLocationResponse, RegisterShuffleResponse};
use riffle_core::meta::{PartitionLocation, PartitionMode, PartitionType, WorkerInfo};

/// Where a shuffle stands relative to its stage-end barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEndState {
    NotStarted,
    InProgress,
    /// Commit finished and every partition has at least one surviving
    /// location
    Done,
    /// Commit finished but some partition lost both of its locations
    DataLost,
}

impl StageEndState {
    pub fn is_finished(&self) -> bool {
        matches!(self, StageEndState::Done | StageEndState::DataLost)
    }
}

/// The locations one worker holds for one shuffle.
/// No two entries share `(partition id, epoch, mode)`.
#[derive(Debug, Default, Clone)]
pub struct PartitionLocationInfo {
    pub primaries: Vec<PartitionLocation>,
    pub replicas: Vec<PartitionLocation>,
}

impl PartitionLocationInfo {
    pub fn add_primary(&mut self, location: PartitionLocation) {
        debug_assert_eq!(PartitionMode::Primary, location.mode);
        if !self
            .primaries
            .iter()
            .any(|p| p.id == location.id && p.epoch == location.epoch)
        {
            self.primaries.push(location);
        }
    }

    pub fn add_replica(&mut self, location: PartitionLocation) {
        debug_assert_eq!(PartitionMode::Replica, location.mode);
        if !self
            .replicas
            .iter()
            .any(|r| r.id == location.id && r.epoch == location.epoch)
        {
            self.replicas.push(location);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primaries.is_empty() && self.replicas.is_empty()
    }

    pub fn primary_unique_ids(&self) -> Vec<String> {
        self.primaries.iter().map(|p| p.unique_id()).collect()
    }

    pub fn replica_unique_ids(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.unique_id()).collect()
    }
}

/// Immutable sizing facts fixed at registration time
#[derive(Debug, Clone, Copy)]
pub struct ShuffleMeta {
    pub num_mappers: u32,
    pub num_reducers: u32,
    /// Size of the partition-id space: `num_reducers` for reduce partitions,
    /// `num_mappers` for map partitions
    pub num_partitions: u32,
    pub partition_type: PartitionType,
}

pub type ChangeWaiter = oneshot::Sender<ChangeLocationResponse>;

/// Per-shuffle record. Every field is either a concurrent map or guarded by
/// its own lock; cross-field consistency follows the handler ordering rules
/// (registration happens-before everything that observes `registered`).
pub struct ShuffleState {
    pub shuffle_id: u32,
    registered: AtomicBool,
    meta: RwLock<Option<ShuffleMeta>>,
    initial_primaries: RwLock<Vec<PartitionLocation>>,
    mapper_attempts: Mutex<Vec<i32>>,
    allocated_workers: RwLock<HashMap<WorkerInfo, PartitionLocationInfo>>,
    latest_locations: RwLock<HashMap<u32, PartitionLocation>>,
    pending_changes: Mutex<HashMap<u32, Vec<ChangeWaiter>>>,
    file_groups: RwLock<Vec<Vec<PartitionLocation>>>,
    stage_end: watch::Sender<StageEndState>,
}

/// Outcome of recording one mapper-end call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperEndOutcome {
    /// First end call of this mapper; `all_ended` is true when it was the
    /// last open one
    Recorded { all_ended: bool },
    /// The mapper had already ended (duplicate or speculative attempt)
    Duplicate,
}

impl ShuffleState {
    fn new(shuffle_id: u32) -> Self {
        let (stage_end, _) = watch::channel(StageEndState::NotStarted);
        Self {
            shuffle_id,
            registered: AtomicBool::new(false),
            meta: RwLock::new(None),
            initial_primaries: RwLock::new(vec![]),
            mapper_attempts: Mutex::new(vec![]),
            allocated_workers: RwLock::new(HashMap::new()),
            latest_locations: RwLock::new(HashMap::new()),
            pending_changes: Mutex::new(HashMap::new()),
            file_groups: RwLock::new(vec![]),
            stage_end,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn meta(&self) -> Option<ShuffleMeta> {
        *self.meta.read()
    }

    /// Fill in everything registration produced and make the shuffle visible
    /// as registered. Must be called exactly once, by the first requester.
    pub fn complete(
        &self,
        meta: ShuffleMeta,
        initial_primaries: Vec<PartitionLocation>,
        allocated: HashMap<WorkerInfo, PartitionLocationInfo>,
    ) {
        {
            let mut latest = self.latest_locations.write();
            for primary in &initial_primaries {
                latest.insert(primary.id, primary.clone());
            }
        }
        {
            let mut attempts = self.mapper_attempts.lock();
            if attempts.len() < meta.num_mappers as usize {
                attempts.resize(meta.num_mappers as usize, -1);
            }
        }
        *self.file_groups.write() = vec![vec![]; meta.num_partitions as usize];
        *self.allocated_workers.write() = allocated;
        *self.initial_primaries.write() = initial_primaries;
        *self.meta.write() = Some(meta);
        self.registered.store(true, Ordering::Release);
    }

    pub fn initial_primaries(&self) -> Vec<PartitionLocation> {
        self.initial_primaries.read().clone()
    }

    // -- mapper attempts ----------------------------------------------------

    /// Record that `map_id` finished with `attempt_id`. The first call wins;
    /// replays and speculative attempts are no-ops.
    pub fn record_mapper_end(
        &self,
        map_id: u32,
        attempt_id: i32,
        num_mappers: u32,
    ) -> MapperEndOutcome {
        let mut attempts = self.mapper_attempts.lock();
        if attempts.len() < num_mappers as usize {
            attempts.resize(num_mappers as usize, -1);
        }
        if map_id as usize >= attempts.len() {
            warn!(
                "Mapper {} outside the mapper space of shuffle {}, ignoring",
                map_id, self.shuffle_id
            );
            return MapperEndOutcome::Duplicate;
        }
        let slot = &mut attempts[map_id as usize];
        if *slot < 0 {
            *slot = attempt_id;
            MapperEndOutcome::Recorded {
                all_ended: attempts.iter().all(|a| *a >= 0),
            }
        } else {
            MapperEndOutcome::Duplicate
        }
    }

    pub fn mapper_ended(&self, map_id: u32) -> bool {
        self.mapper_attempts
            .lock()
            .get(map_id as usize)
            .map(|a| *a >= 0)
            .unwrap_or(false)
    }

    pub fn mapper_attempts_snapshot(&self) -> Vec<i32> {
        self.mapper_attempts.lock().clone()
    }

    // -- partition locations ------------------------------------------------

    pub fn latest_location(&self, partition_id: u32) -> Option<PartitionLocation> {
        self.latest_locations.read().get(&partition_id).cloned()
    }

    /// Install `location` as the newest primary of its partition if its
    /// epoch is higher than what we know.
    pub fn update_latest_location(&self, location: &PartitionLocation) {
        debug_assert_eq!(PartitionMode::Primary, location.mode);
        let mut latest = self.latest_locations.write();
        match latest.get(&location.id) {
            Some(known) if known.epoch >= location.epoch => {}
            _ => {
                latest.insert(location.id, location.clone());
            }
        }
    }

    pub fn add_worker_locations(
        &self,
        worker: &WorkerInfo,
        primaries: Vec<PartitionLocation>,
        replicas: Vec<PartitionLocation>,
    ) {
        let mut allocated = self.allocated_workers.write();
        let info = allocated.entry(worker.clone()).or_default();
        for primary in primaries {
            info.add_primary(primary);
        }
        for replica in replicas {
            info.add_replica(replica);
        }
    }

    pub fn allocated_workers(&self) -> Vec<WorkerInfo> {
        self.allocated_workers.read().keys().cloned().collect()
    }

    pub fn worker_locations(&self) -> HashMap<WorkerInfo, PartitionLocationInfo> {
        self.allocated_workers.read().clone()
    }

    pub fn has_allocated_locations(&self) -> bool {
        self.allocated_workers.read().values().any(|info| !info.is_empty())
    }

    /// Drop every per-worker location of this shuffle, returning what was
    /// held so the caller can release it remotely.
    pub fn clear_worker_locations(&self) -> HashMap<WorkerInfo, PartitionLocationInfo> {
        std::mem::take(&mut *self.allocated_workers.write())
    }

    // -- partition-change coalescing ----------------------------------------

    /// Join the pending set of `partition_id`. Returns `None` when the
    /// caller is the first requester (and must do the work), or a receiver
    /// that resolves once the first requester finishes.
    pub fn join_change_requesters(
        &self,
        partition_id: u32,
    ) -> Option<oneshot::Receiver<ChangeLocationResponse>> {
        let mut pending = self.pending_changes.lock();
        match pending.get_mut(&partition_id) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            }
            None => {
                pending.insert(partition_id, vec![]);
                None
            }
        }
    }

    /// Close the pending set of `partition_id` and hand back everyone who
    /// queued behind the first requester.
    pub fn drain_change_requesters(&self, partition_id: u32) -> Vec<ChangeWaiter> {
        self.pending_changes
            .lock()
            .remove(&partition_id)
            .unwrap_or_default()
    }

    // -- stage end -----------------------------------------------------------

    pub fn stage_end_state(&self) -> StageEndState {
        *self.stage_end.borrow()
    }

    /// Claim the stage-end barrier. Only the first caller gets `true`; the
    /// barrier runs at most once per shuffle.
    pub fn try_begin_stage_end(&self) -> bool {
        self.stage_end.send_if_modified(|state| {
            if *state == StageEndState::NotStarted {
                *state = StageEndState::InProgress;
                true
            } else {
                false
            }
        })
    }

    pub fn finish_stage_end(&self, data_lost: bool) {
        let state = if data_lost {
            StageEndState::DataLost
        } else {
            StageEndState::Done
        };
        let _ = self.stage_end.send(state);
    }

    pub fn subscribe_stage_end(&self) -> watch::Receiver<StageEndState> {
        self.stage_end.subscribe()
    }

    /// Wait until the barrier finishes, bounded by `timeout`. Returns the
    /// terminal state, or `None` when the timeout elapsed first.
    pub async fn wait_stage_end(&self, timeout: Duration) -> Option<StageEndState> {
        let mut rx = self.subscribe_stage_end();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_finished())).await;
        match result {
            Ok(Ok(state)) => Some(*state),
            // the watch sender lives as long as this state, so a closed
            // channel means the shuffle was dropped mid-wait
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }

    // -- reducer file groups -------------------------------------------------

    pub fn set_file_groups(&self, groups: Vec<Vec<PartitionLocation>>) {
        *self.file_groups.write() = groups;
    }

    pub fn file_groups(&self) -> Vec<Vec<PartitionLocation>> {
        self.file_groups.read().clone()
    }
}

/// What [`ShuffleManager::begin_registration`] tells the caller to do
pub enum Registration {
    /// Run the registration pipeline and call `complete_registration`
    FirstRequester,
    /// Somebody else is registering; await their terminal response
    Pending(oneshot::Receiver<RegisterShuffleResponse>),
    /// Registration already finished; here are the epoch-0 primaries
    AlreadyRegistered(Vec<PartitionLocation>),
}

pub struct ShuffleManager {
    shuffles: RwLock<HashMap<u32, Arc<ShuffleState>>>,
    registering: Mutex<HashMap<u32, Vec<oneshot::Sender<RegisterShuffleResponse>>>>,
    unregister_time: Mutex<HashMap<u32, Instant>>,
}

impl Default for ShuffleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShuffleManager {
    pub fn new() -> Self {
        Self {
            shuffles: RwLock::new(HashMap::new()),
            registering: Mutex::new(HashMap::new()),
            unregister_time: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, shuffle_id: u32) -> Option<Arc<ShuffleState>> {
        self.shuffles.read().get(&shuffle_id).cloned()
    }

    pub fn get_registered(&self, shuffle_id: u32) -> Option<Arc<ShuffleState>> {
        self.get(shuffle_id).filter(|s| s.is_registered())
    }

    /// Fetch or lazily create the record of `shuffle_id`. Mapper-end may
    /// legitimately touch a shuffle before its registration finished.
    pub fn get_or_create(&self, shuffle_id: u32) -> Arc<ShuffleState> {
        if let Some(state) = self.get(shuffle_id) {
            return state;
        }
        self.shuffles
            .write()
            .entry(shuffle_id)
            .or_insert_with(|| Arc::new(ShuffleState::new(shuffle_id)))
            .clone()
    }

    /// At most one in-flight allocation per shuffle id: the first requester
    /// proceeds, everyone else parks against the pending set and receives
    /// the first requester's terminal response.
    pub fn begin_registration(&self, shuffle_id: u32) -> Registration {
        let mut registering = self.registering.lock();
        if let Some(state) = self.get(shuffle_id) {
            if state.is_registered() {
                return Registration::AlreadyRegistered(state.initial_primaries());
            }
        }
        match registering.get_mut(&shuffle_id) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Registration::Pending(rx)
            }
            None => {
                registering.insert(shuffle_id, vec![]);
                Registration::FirstRequester
            }
        }
    }

    /// Publish the terminal response of an allocation attempt to every
    /// parked requester. The caller must have made the shuffle state visible
    /// (on success) before calling this.
    pub fn complete_registration(&self, shuffle_id: u32, response: &RegisterShuffleResponse) {
        let waiters = self
            .registering
            .lock()
            .remove(&shuffle_id)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(response.clone());
        }
    }

    /// Record the first unregister request of a shuffle. Replays keep the
    /// original timestamp.
    pub fn mark_unregistered(&self, shuffle_id: u32) {
        self.unregister_time
            .lock()
            .entry(shuffle_id)
            .or_insert_with(Instant::now);
    }

    pub fn is_unregistered(&self, shuffle_id: u32) -> bool {
        self.unregister_time.lock().contains_key(&shuffle_id)
    }

    /// Shuffles whose unregister happened more than `delay` ago, removed
    /// from the expiration queue as they are returned.
    pub fn take_expired(&self, delay: Duration) -> Vec<u32> {
        let mut unregister_time = self.unregister_time.lock();
        let expired: Vec<u32> = unregister_time
            .iter()
            .filter(|(_, at)| at.elapsed() >= delay)
            .map(|(id, _)| *id)
            .collect();
        for shuffle_id in &expired {
            unregister_time.remove(shuffle_id);
        }
        expired
    }

    /// Drop every trace of a shuffle
    pub fn remove(&self, shuffle_id: u32) {
        self.shuffles.write().remove(&shuffle_id);
        self.registering.lock().remove(&shuffle_id);
        self.unregister_time.lock().remove(&shuffle_id);
    }

    pub fn contains(&self, shuffle_id: u32) -> bool {
        self.shuffles.read().contains_key(&shuffle_id)
    }
}
