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

//! Turns a computed [`WorkerResource`] into actually reserved worker slots.
//!
//! Reservation is a fan-out with partial-failure surgery: workers that
//! refuse a reservation are blacklisted and cut out of the resource; when
//! replication is on, the stranded peer of every victim is destroyed too (a
//! lone replica without its primary only leaks the worker's buffer), the
//! freed quota is returned to the master, and replacements are allocated
//! from the surviving candidates before the next attempt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use itertools::{Either, Itertools};
use log::{debug, warn};

use riffle_core::config::RiffleConfig;
use riffle_core::error::{Result, RiffleError};
use riffle_core::messages::{
    shuffle_key, DestroyRequest, ReleaseSlotsRequest, ReserveSlotsRequest, ReserveSlotsResponse,
};
use riffle_core::meta::{PartitionMode, UserIdentifier, WorkerInfo, WorkerResource};
use riffle_core::rpc::MasterClient;

use crate::state::slot_allocator::{allocate, PartitionSpec};
use crate::state::worker_manager::WorkerManager;

pub struct ReservationManager {
    worker_manager: Arc<WorkerManager>,
    master: Arc<dyn MasterClient>,
    conf: RiffleConfig,
    user_identifier: UserIdentifier,
}

impl ReservationManager {
    pub fn new(
        worker_manager: Arc<WorkerManager>,
        master: Arc<dyn MasterClient>,
        conf: RiffleConfig,
        user_identifier: UserIdentifier,
    ) -> Self {
        Self {
            worker_manager,
            master,
            conf,
            user_identifier,
        }
    }

    /// Reserve every slot in `slots`, retrying reservation failures up to
    /// `reserve_slots_max_retry` times with re-allocated replacements.
    ///
    /// On success every partition of the original resource has a reserved
    /// primary (and replica, under replication) on some worker in `slots`.
    /// On terminal failure every remaining reservation is destroyed and
    /// `slots` is left empty.
    pub async fn reserve_slots_with_retry(
        &self,
        app_id: &str,
        shuffle_id: u32,
        candidates: &[WorkerInfo],
        slots: &mut WorkerResource,
    ) -> Result<()> {
        let replicate = self.conf.replicate();
        let max_retry = self.conf.reserve_slots_max_retry().max(1);
        let retry_wait = Duration::from_millis(self.conf.reserve_slots_retry_wait_ms());

        let mut to_reserve = slots.clone();
        for attempt in 0..max_retry {
            let failed = self.reserve_round(app_id, shuffle_id, &to_reserve).await;
            if failed.is_empty() {
                debug!(
                    "Reserved slots of shuffle {} on {} workers in attempt {}",
                    shuffle_id,
                    slots.len(),
                    attempt
                );
                return Ok(());
            }

            let victims = self.cut_out_failures(app_id, shuffle_id, slots, &failed, replicate);
            self.release_quota(app_id, shuffle_id, &failed).await;

            if attempt + 1 == max_retry {
                break;
            }

            // replacements come from the surviving reservations plus the
            // original candidate set, minus whatever is blacklisted by now
            let mut retry_candidates: Vec<WorkerInfo> = slots.keys().cloned().collect();
            for candidate in candidates {
                if !retry_candidates.contains(candidate) {
                    retry_candidates.push(candidate.clone());
                }
            }
            let retry_candidates = self.worker_manager.usable_candidates(&retry_candidates);

            let specs: Vec<PartitionSpec> = victims
                .iter()
                .map(|(id, epoch)| PartitionSpec::retry(*id, *epoch))
                .collect();
            match allocate(&retry_candidates, &specs, replicate) {
                Ok(replacement) => {
                    for (worker, (primaries, replicas)) in &replacement {
                        let entry = slots.entry(worker.clone()).or_insert_with(|| (vec![], vec![]));
                        entry.0.extend(primaries.iter().cloned());
                        entry.1.extend(replicas.iter().cloned());
                    }
                    to_reserve = replacement;
                }
                Err(e) => {
                    warn!(
                        "Cannot re-allocate {} victim partitions of shuffle {}: {}",
                        specs.len(),
                        shuffle_id,
                        e
                    );
                    break;
                }
            }

            tokio::time::sleep(retry_wait).await;
        }

        // terminal failure: free every worker-side buffer we still hold
        self.destroy_resource(app_id, shuffle_id, slots).await;
        slots.clear();
        Err(RiffleError::ReserveSlotsFailed(format!(
            "Could not reserve slots of shuffle {} within {} attempts",
            shuffle_id, max_retry
        )))
    }

    /// Fan out one round of `ReserveSlots`, returning the workers that did
    /// not accept.
    async fn reserve_round(
        &self,
        app_id: &str,
        shuffle_id: u32,
        to_reserve: &WorkerResource,
    ) -> Vec<WorkerInfo> {
        if to_reserve.is_empty() {
            return vec![];
        }
        let parallelism = self.fan_out_parallelism(to_reserve.len());

        let mut requests = FuturesUnordered::new();
        let mut pending: Vec<(WorkerInfo, ReserveSlotsRequest)> = to_reserve
            .iter()
            .map(|(worker, (primaries, replicas))| {
                (
                    worker.clone(),
                    ReserveSlotsRequest {
                        app_id: app_id.to_owned(),
                        shuffle_id,
                        primary_locations: primaries.clone(),
                        replica_locations: replicas.clone(),
                        split_threshold: self.conf.partition_split_threshold(),
                        split_mode: self.conf.partition_split_mode(),
                        partition_type: self.conf.partition_type(),
                        range_read_filter: self.conf.range_read_filter(),
                        user_identifier: self.user_identifier.clone(),
                    },
                )
            })
            .collect();

        let mut results: Vec<(WorkerInfo, Result<ReserveSlotsResponse>)> = vec![];
        loop {
            while requests.len() < parallelism {
                match pending.pop() {
                    Some((worker, request)) => requests.push(self.reserve_one(worker, request)),
                    None => break,
                }
            }
            match requests.next().await {
                Some(result) => results.push(result),
                None => break,
            }
        }

        let (ok, failed): (Vec<WorkerInfo>, Vec<WorkerInfo>) =
            results.into_iter().partition_map(|(worker, result)| match result {
                Ok(response) if response.status.is_success() => Either::Left(worker),
                Ok(response) => {
                    warn!(
                        "Worker {} rejected reservation of shuffle {}: {}",
                        worker, shuffle_id, response.reason
                    );
                    Either::Right(worker)
                }
                Err(e) => {
                    warn!(
                        "Reserve slots of shuffle {} on worker {} failed: {}",
                        shuffle_id, worker, e
                    );
                    Either::Right(worker)
                }
            });
        debug!(
            "Reserve round of shuffle {}: {} ok, {} failed",
            shuffle_id,
            ok.len(),
            failed.len()
        );
        failed
    }

    async fn reserve_one(
        &self,
        worker: WorkerInfo,
        request: ReserveSlotsRequest,
    ) -> (WorkerInfo, Result<ReserveSlotsResponse>) {
        let result = match self.worker_manager.get_client(&worker).await {
            Ok(client) => client.reserve_slots(request).await,
            Err(e) => Err(e),
        };
        (worker, result)
    }

    /// Remove every failed worker from `slots`, destroy the stranded peers
    /// of its locations and return the distinct `(partition, epoch)` victims
    /// that need re-placement.
    fn cut_out_failures(
        &self,
        app_id: &str,
        shuffle_id: u32,
        slots: &mut WorkerResource,
        failed: &[WorkerInfo],
        replicate: bool,
    ) -> HashSet<(u32, u32)> {
        let mut victims: HashSet<(u32, u32)> = HashSet::new();
        let mut stranded: HashMap<WorkerInfo, (Vec<String>, Vec<String>)> = HashMap::new();

        for worker in failed {
            self.worker_manager.add_to_blacklist(worker);
            let (primaries, replicas) = match slots.remove(worker) {
                Some(locations) => locations,
                None => continue,
            };
            for location in primaries.iter().chain(replicas.iter()) {
                victims.insert((location.id, location.epoch));
                if !replicate {
                    continue;
                }
                if let Some(peer) = location.peer() {
                    if failed.contains(&peer.worker) {
                        // the peer's own failure handles it
                        continue;
                    }
                    if remove_location(slots, &peer.worker, peer.id, peer.epoch, peer.mode) {
                        let lists = stranded.entry(peer.worker.clone()).or_default();
                        match peer.mode {
                            PartitionMode::Primary => lists.0.push(peer.unique_id()),
                            PartitionMode::Replica => lists.1.push(peer.unique_id()),
                        }
                    }
                }
            }
        }

        if !stranded.is_empty() {
            let key = shuffle_key(app_id, shuffle_id);
            for (worker, (primary_ids, replica_ids)) in stranded {
                // peers are destroyed asynchronously; the slots map already
                // dropped them so a late failure only leaks until expiry
                let request = DestroyRequest {
                    shuffle_key: key.clone(),
                    primary_unique_ids: primary_ids,
                    replica_unique_ids: replica_ids,
                };
                let worker_manager = self.worker_manager.clone();
                tokio::spawn(async move {
                    destroy_with_retry(&worker_manager, &worker, request).await;
                });
            }
        }

        victims
    }

    /// Hand freed quota back to the master. Best effort.
    async fn release_quota(&self, app_id: &str, shuffle_id: u32, failed: &[WorkerInfo]) {
        if failed.is_empty() {
            return;
        }
        let request = ReleaseSlotsRequest {
            app_id: app_id.to_owned(),
            shuffle_id,
            worker_ids: failed.iter().map(|w| w.to_string()).collect(),
            slots_per_worker: vec![],
        };
        if let Err(e) = self.master.release_slots(request).await {
            warn!(
                "Failed to release slots of shuffle {} at the master: {}",
                shuffle_id, e
            );
        }
    }

    /// Destroy every reservation still present in `resource`
    pub async fn destroy_resource(
        &self,
        app_id: &str,
        shuffle_id: u32,
        resource: &WorkerResource,
    ) {
        let key = shuffle_key(app_id, shuffle_id);
        for (worker, (primaries, replicas)) in resource {
            let request = DestroyRequest {
                shuffle_key: key.clone(),
                primary_unique_ids: primaries.iter().map(|p| p.unique_id()).collect(),
                replica_unique_ids: replicas.iter().map(|r| r.unique_id()).collect(),
            };
            destroy_with_retry(&self.worker_manager, worker, request).await;
        }
    }

    fn fan_out_parallelism(&self, slots: usize) -> usize {
        slots.max(1).min(self.conf.rpc_max_parallelism().max(1) as usize)
    }
}

/// Remove the location `(partition_id, epoch, mode)` from `worker`'s entry
/// in `slots`. Returns whether anything was removed.
fn remove_location(
    slots: &mut WorkerResource,
    worker: &WorkerInfo,
    partition_id: u32,
    epoch: u32,
    mode: PartitionMode,
) -> bool {
    let removed = match slots.get_mut(worker) {
        Some((primaries, replicas)) => {
            let list = match mode {
                PartitionMode::Primary => &mut *primaries,
                PartitionMode::Replica => &mut *replicas,
            };
            let before = list.len();
            list.retain(|l| !(l.id == partition_id && l.epoch == epoch));
            list.len() < before
        }
        None => return false,
    };
    if slots
        .get(worker)
        .map(|(primaries, replicas)| primaries.is_empty() && replicas.is_empty())
        .unwrap_or(false)
    {
        slots.remove(worker);
    }
    removed
}

/// Destroy with one retry targeted at whatever the first call failed on
async fn destroy_with_retry(
    worker_manager: &Arc<WorkerManager>,
    worker: &WorkerInfo,
    request: DestroyRequest,
) {
    let client = match worker_manager.get_client(worker).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot destroy slots on worker {}: {}", worker, e);
            return;
        }
    };

    let retry_request = match client.destroy(request.clone()).await {
        Ok(response) if response.status.is_success() => return,
        Ok(response) => DestroyRequest {
            shuffle_key: request.shuffle_key.clone(),
            primary_unique_ids: response.failed_primary_ids,
            replica_unique_ids: response.failed_replica_ids,
        },
        Err(e) => {
            warn!("Destroy on worker {} failed: {}, retrying once", worker, e);
            request
        }
    };

    match client.destroy(retry_request).await {
        Ok(response) if response.status.is_success() => {}
        Ok(response) => warn!(
            "Destroy retry on worker {} left {} primary and {} replica slots behind",
            worker,
            response.failed_primary_ids.len(),
            response.failed_replica_ids.len()
        ),
        Err(e) => warn!("Destroy retry on worker {} failed: {}", worker, e),
    }
}
