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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use log::{debug, info, warn};

use riffle_core::config::RiffleConfig;
use riffle_core::messages::{
    ChangeLocationResponse, GetReducerFileGroupResponse, RegisterShuffleResponse,
    ReleaseSlotsRequest, RequestSlotsRequest, ReviveCause, StatusCode,
};
use riffle_core::meta::{
    PartitionLocation, UserIdentifier, WorkerInfo, WorkerResource,
};
use riffle_core::rpc::{MasterClient, WorkerClientFactory};

use crate::state::reservation::ReservationManager;
use crate::state::shuffle_manager::{
    MapperEndOutcome, PartitionLocationInfo, Registration, ShuffleManager, ShuffleMeta,
    StageEndState,
};
use crate::state::slot_allocator::{allocate, PartitionSpec};
use crate::state::stage_manager::StageManager;
use crate::state::worker_manager::WorkerManager;

pub mod reservation;
pub mod shuffle_manager;
pub mod slot_allocator;
pub mod stage_manager;
pub mod worker_manager;

/// What kind of partition change a task asked for
#[derive(Debug, Clone, Copy)]
pub enum ChangeContext {
    Revive {
        map_id: u32,
        attempt_id: i32,
        cause: ReviveCause,
    },
    Split,
}

/// All mutable coordinator state plus the managers operating on it. One
/// value of this type exists per application.
pub struct CoordinatorState {
    pub app_id: String,
    pub coordinator_host: String,
    pub conf: RiffleConfig,
    pub user_identifier: UserIdentifier,
    pub master: Arc<dyn MasterClient>,
    pub shuffle_manager: ShuffleManager,
    pub worker_manager: Arc<WorkerManager>,
    pub reservation_manager: ReservationManager,
    pub stage_manager: StageManager,
}

impl CoordinatorState {
    pub fn new(
        app_id: String,
        coordinator_host: String,
        conf: RiffleConfig,
        user_identifier: UserIdentifier,
        master: Arc<dyn MasterClient>,
        worker_factory: Arc<dyn WorkerClientFactory>,
    ) -> Self {
        let worker_manager = Arc::new(WorkerManager::new(worker_factory));
        let reservation_manager = ReservationManager::new(
            worker_manager.clone(),
            master.clone(),
            conf.clone(),
            user_identifier.clone(),
        );
        let stage_manager =
            StageManager::new(worker_manager.clone(), master.clone(), conf.clone());
        Self {
            app_id,
            coordinator_host,
            conf,
            user_identifier,
            master,
            shuffle_manager: ShuffleManager::new(),
            worker_manager,
            reservation_manager,
            stage_manager,
        }
    }

    // -- registration ---------------------------------------------------------

    /// Register a shuffle, allocating and reserving its initial partition
    /// locations. Concurrent callers for the same shuffle id coalesce onto
    /// one allocation; replays of a finished registration get the original
    /// epoch-0 primaries back.
    pub async fn register_shuffle(
        &self,
        shuffle_id: u32,
        num_mappers: u32,
        num_reducers: u32,
    ) -> RegisterShuffleResponse {
        match self.shuffle_manager.begin_registration(shuffle_id) {
            Registration::AlreadyRegistered(primaries) => {
                debug!("Shuffle {} already registered", shuffle_id);
                RegisterShuffleResponse {
                    status: StatusCode::Success,
                    partition_locations: primaries,
                }
            }
            Registration::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| RegisterShuffleResponse::failed(StatusCode::Failed)),
            Registration::FirstRequester => {
                let response = self
                    .run_registration(shuffle_id, num_mappers, num_reducers)
                    .await;
                self.shuffle_manager
                    .complete_registration(shuffle_id, &response);
                response
            }
        }
    }

    async fn run_registration(
        &self,
        shuffle_id: u32,
        num_mappers: u32,
        num_reducers: u32,
    ) -> RegisterShuffleResponse {
        match self.master.check_quota(&self.user_identifier).await {
            Ok(quota) if quota.available => {}
            Ok(_) => {
                warn!(
                    "User {} has no quota left, rejecting shuffle {}",
                    self.user_identifier, shuffle_id
                );
                return RegisterShuffleResponse::failed(StatusCode::Failed);
            }
            Err(e) => {
                warn!("Quota check of shuffle {} failed: {}", shuffle_id, e);
                return RegisterShuffleResponse::failed(StatusCode::MasterUnreachable);
            }
        }

        let partition_type = self.conf.partition_type();
        let num_partitions = partition_type.num_partitions(num_mappers, num_reducers);

        let resource = match self.request_slots(shuffle_id, num_partitions).await {
            Ok(resource) => resource,
            Err(status) => return RegisterShuffleResponse::failed(status),
        };

        // resolve endpoints up front; workers we cannot reach are
        // blacklisted by the manager and excluded from the candidate set
        let workers: Vec<WorkerInfo> = resource.keys().cloned().collect();
        let resolutions = future::join_all(
            workers
                .iter()
                .map(|worker| async move { self.worker_manager.get_client(worker).await.is_ok() }),
        )
        .await;
        let candidates: Vec<WorkerInfo> = workers
            .into_iter()
            .zip(resolutions)
            .filter(|(_, reachable)| *reachable)
            .map(|(worker, _)| worker)
            .collect();

        let mut slots = resource;
        if let Err(e) = self
            .reservation_manager
            .reserve_slots_with_retry(&self.app_id, shuffle_id, &candidates, &mut slots)
            .await
        {
            warn!("Reservation of shuffle {} failed: {}", shuffle_id, e);
            let release = ReleaseSlotsRequest::release_all(&self.app_id, shuffle_id);
            if let Err(e) = self.master.release_slots(release).await {
                warn!(
                    "Failed to release slots of shuffle {} at the master: {}",
                    shuffle_id, e
                );
            }
            return RegisterShuffleResponse::failed(StatusCode::ReserveSlotsFailed);
        }

        let shuffle = self.shuffle_manager.get_or_create(shuffle_id);
        let mut allocated: HashMap<WorkerInfo, PartitionLocationInfo> = HashMap::new();
        let mut initial_primaries: Vec<PartitionLocation> = vec![];
        for (worker, (primaries, replicas)) in slots {
            let info = allocated.entry(worker).or_default();
            for primary in primaries {
                initial_primaries.push(primary.clone());
                info.add_primary(primary);
            }
            for replica in replicas {
                info.add_replica(replica);
            }
        }
        initial_primaries.sort_by_key(|p| p.id);
        shuffle.complete(
            ShuffleMeta {
                num_mappers,
                num_reducers,
                num_partitions,
                partition_type,
            },
            initial_primaries.clone(),
            allocated,
        );
        info!(
            "Registered shuffle {} with {} partitions on {} workers",
            shuffle_id,
            num_partitions,
            shuffle.allocated_workers().len()
        );

        RegisterShuffleResponse {
            status: StatusCode::Success,
            partition_locations: initial_primaries,
        }
    }

    /// Ask the master for a slot offer, retrying exactly once on a
    /// non-success answer.
    async fn request_slots(
        &self,
        shuffle_id: u32,
        num_partitions: u32,
    ) -> Result<WorkerResource, StatusCode> {
        let request = RequestSlotsRequest {
            app_id: self.app_id.clone(),
            shuffle_id,
            partition_ids: (0..num_partitions).collect(),
            coordinator_host: self.coordinator_host.clone(),
            replicate: self.conf.replicate(),
            user_identifier: self.user_identifier.clone(),
        };

        let mut last_status = StatusCode::MasterUnreachable;
        for attempt in 0..2 {
            match self.master.request_slots(request.clone()).await {
                Ok(response) if response.status.is_success() => {
                    if response.resource.is_empty() {
                        return Err(StatusCode::SlotNotAvailable);
                    }
                    return Ok(response.resource);
                }
                Ok(response) => {
                    warn!(
                        "Master answered {:?} to slot request of shuffle {} (attempt {})",
                        response.status, shuffle_id, attempt
                    );
                    last_status = match response.status {
                        StatusCode::SlotNotAvailable => StatusCode::SlotNotAvailable,
                        _ => StatusCode::Failed,
                    };
                }
                Err(e) => {
                    warn!(
                        "Slot request of shuffle {} failed (attempt {}): {}",
                        shuffle_id, attempt, e
                    );
                    last_status = StatusCode::MasterUnreachable;
                }
            }
        }
        Err(last_status)
    }

    // -- partition change -----------------------------------------------------

    /// Replace `(partition_id, old_epoch)` with a fresh location. Concurrent
    /// requests for the same partition coalesce: the first does the work and
    /// everybody receives the same answer.
    pub async fn handle_partition_change(
        &self,
        shuffle_id: u32,
        partition_id: u32,
        old_epoch: u32,
        old_location: Option<PartitionLocation>,
        context: ChangeContext,
    ) -> ChangeLocationResponse {
        let shuffle = match self.shuffle_manager.get_registered(shuffle_id) {
            Some(shuffle) => shuffle,
            None => return ChangeLocationResponse::failed(StatusCode::ShuffleNotRegistered),
        };

        if let ChangeContext::Revive { map_id, .. } = context {
            if shuffle.mapper_ended(map_id) {
                debug!(
                    "Mapper {} of shuffle {} already ended, not reviving partition {}",
                    map_id, shuffle_id, partition_id
                );
                return ChangeLocationResponse::failed(StatusCode::MapEnded);
            }
        }

        if let Some(rx) = shuffle.join_change_requesters(partition_id) {
            return rx
                .await
                .unwrap_or_else(|_| ChangeLocationResponse::failed(StatusCode::Failed));
        }

        let response = self
            .change_partition(&shuffle, partition_id, old_epoch, old_location, context)
            .await;
        for waiter in shuffle.drain_change_requesters(partition_id) {
            let _ = waiter.send(response.clone());
        }
        response
    }

    async fn change_partition(
        &self,
        shuffle: &Arc<shuffle_manager::ShuffleState>,
        partition_id: u32,
        old_epoch: u32,
        old_location: Option<PartitionLocation>,
        context: ChangeContext,
    ) -> ChangeLocationResponse {
        // somebody already replaced this epoch; hand out the newer location
        if let Some(latest) = shuffle.latest_location(partition_id) {
            if latest.epoch > old_epoch {
                return ChangeLocationResponse {
                    status: StatusCode::Success,
                    location: Some(latest),
                };
            }
        }

        if let ChangeContext::Revive {
            cause: ReviveCause::PrimaryPushFailure,
            ..
        } = context
        {
            if let Some(old) = &old_location {
                self.worker_manager.add_to_blacklist(&old.worker);
            }
        }

        let allocated = shuffle.allocated_workers();
        let candidates = self.worker_manager.usable_candidates(&allocated);
        let required = if self.conf.replicate() { 2 } else { 1 };
        if candidates.len() < required {
            warn!(
                "Cannot replace partition {} of shuffle {}: {} of {} allocated workers usable",
                partition_id,
                shuffle.shuffle_id,
                candidates.len(),
                allocated.len()
            );
            return ChangeLocationResponse::failed(StatusCode::SlotNotAvailable);
        }

        let spec = match &old_location {
            Some(old) => PartitionSpec::renewal(old.id, old.epoch),
            None => PartitionSpec::renewal(partition_id, old_epoch),
        };
        let mut slots = match allocate(&candidates, &[spec], self.conf.replicate()) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(
                    "Cannot allocate replacement of partition {} of shuffle {}: {}",
                    partition_id, shuffle.shuffle_id, e
                );
                return ChangeLocationResponse::failed(StatusCode::SlotNotAvailable);
            }
        };

        if let Err(e) = self
            .reservation_manager
            .reserve_slots_with_retry(&self.app_id, shuffle.shuffle_id, &candidates, &mut slots)
            .await
        {
            warn!(
                "Cannot reserve replacement of partition {} of shuffle {}: {}",
                partition_id, shuffle.shuffle_id, e
            );
            return ChangeLocationResponse::failed(StatusCode::ReserveSlotsFailed);
        }

        let mut new_primary: Option<PartitionLocation> = None;
        let mut new_replica: Option<PartitionLocation> = None;
        for (worker, (primaries, replicas)) in &slots {
            shuffle.add_worker_locations(worker, primaries.clone(), replicas.clone());
            for primary in primaries {
                shuffle.update_latest_location(primary);
                if primary.id == spec.partition_id {
                    new_primary = Some(primary.clone());
                }
            }
            for replica in replicas {
                if replica.id == spec.partition_id {
                    new_replica = Some(replica.clone());
                }
            }
        }

        info!(
            "Replaced partition {} of shuffle {} with epoch {}",
            partition_id, shuffle.shuffle_id, spec.epoch
        );
        match new_primary {
            Some(primary) => ChangeLocationResponse {
                status: StatusCode::Success,
                location: Some(primary),
            },
            // only the replica survived reservation; its embedded peer copy
            // is still a usable primary handle
            None => match new_replica.and_then(|replica| replica.peer().cloned()) {
                Some(primary) => ChangeLocationResponse {
                    status: StatusCode::Success,
                    location: Some(primary),
                },
                None => ChangeLocationResponse::failed(StatusCode::Failed),
            },
        }
    }

    // -- mapper end -----------------------------------------------------------

    /// Record a mapper-end call. Returns the reply status and whether this
    /// call closed the last open mapper (in which case the caller owes the
    /// shuffle a stage-end event).
    pub fn mapper_end(
        &self,
        shuffle_id: u32,
        map_id: u32,
        attempt_id: i32,
        num_mappers: u32,
    ) -> (StatusCode, bool) {
        let shuffle = self.shuffle_manager.get_or_create(shuffle_id);
        match shuffle.record_mapper_end(map_id, attempt_id, num_mappers) {
            MapperEndOutcome::Recorded { all_ended } => (StatusCode::Success, all_ended),
            MapperEndOutcome::Duplicate => (StatusCode::Success, false),
        }
    }

    // -- reducer file groups --------------------------------------------------

    /// Answer a reducer, waiting (bounded) for the stage-end barrier first
    pub async fn get_reducer_file_group(&self, shuffle_id: u32) -> GetReducerFileGroupResponse {
        let shuffle = match self.shuffle_manager.get(shuffle_id) {
            Some(shuffle) => shuffle,
            None => return GetReducerFileGroupResponse::failed(StatusCode::ShuffleNotRegistered),
        };

        let timeout = Duration::from_millis(self.conf.stage_end_timeout_ms());
        match shuffle.wait_stage_end(timeout).await {
            None => GetReducerFileGroupResponse::failed(StatusCode::StageEndTimeout),
            Some(StageEndState::DataLost) => {
                GetReducerFileGroupResponse::failed(StatusCode::ShuffleDataLost)
            }
            Some(_) => GetReducerFileGroupResponse {
                status: StatusCode::Success,
                file_groups: shuffle.file_groups(),
                mapper_attempts: shuffle.mapper_attempts_snapshot(),
            },
        }
    }

    // -- unregister & expiration ----------------------------------------------

    /// Clear whatever worker-side state is still around after stage end and
    /// queue the shuffle for expiration. Idempotent.
    pub async fn finish_unregister(&self, shuffle_id: u32) {
        if let Some(shuffle) = self.shuffle_manager.get(shuffle_id) {
            if shuffle.has_allocated_locations() {
                let leftovers = shuffle.clear_worker_locations();
                let resource: WorkerResource = leftovers
                    .into_iter()
                    .map(|(worker, info)| (worker, (info.primaries, info.replicas)))
                    .collect();
                self.reservation_manager
                    .destroy_resource(&self.app_id, shuffle_id, &resource)
                    .await;
                let release = ReleaseSlotsRequest::release_all(&self.app_id, shuffle_id);
                if let Err(e) = self.master.release_slots(release).await {
                    warn!(
                        "Failed to release slots of shuffle {} at the master: {}",
                        shuffle_id, e
                    );
                }
            }
        }
        self.shuffle_manager.mark_unregistered(shuffle_id);
        info!("Shuffle {} unregistered", shuffle_id);
    }

    /// Drop every shuffle whose unregister happened more than
    /// `remove_shuffle_delay` ago and tell the master to forget it.
    pub async fn remove_expired_shuffles(&self) -> Vec<u32> {
        let delay = Duration::from_millis(self.conf.remove_shuffle_delay_ms());
        let expired = self.shuffle_manager.take_expired(delay);
        for shuffle_id in &expired {
            self.shuffle_manager.remove(*shuffle_id);
            if let Err(e) = self.master.unregister_shuffle(&self.app_id, *shuffle_id).await {
                warn!(
                    "Failed to unregister shuffle {} at the master: {}",
                    shuffle_id, e
                );
            }
            info!("Expired shuffle {} removed", shuffle_id);
        }
        expired
    }
}
