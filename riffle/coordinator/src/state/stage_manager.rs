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

//! The stage-end commit barrier.
//!
//! When the last mapper of a shuffle ends, every allocated worker is told to
//! commit its files. Results are gathered into a data-loss determination:
//! without replication any failed primary loses data; with replication a
//! partition is lost only when both of its locations failed. Whatever the
//! outcome, the shuffle is marked ended so reducers unblock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};

use riffle_core::config::RiffleConfig;
use riffle_core::error::Result;
use riffle_core::messages::{CommitFilesRequest, CommitFilesResponse, ReleaseSlotsRequest};
use riffle_core::meta::{PartitionLocation, StorageInfo, WorkerInfo};
use riffle_core::rpc::MasterClient;

use crate::state::shuffle_manager::{PartitionLocationInfo, ShuffleState};
use crate::state::worker_manager::WorkerManager;

#[derive(Default)]
struct CommitGather {
    committed_primary: HashMap<String, StorageInfo>,
    committed_replica: HashMap<String, StorageInfo>,
    failed_primary: HashSet<String>,
    failed_replica: HashSet<String>,
    committed_map_ids: HashMap<String, Vec<u32>>,
}

pub struct StageManager {
    worker_manager: Arc<WorkerManager>,
    master: Arc<dyn MasterClient>,
    conf: RiffleConfig,
    total_written: AtomicU64,
    file_count: AtomicU64,
}

impl StageManager {
    pub fn new(
        worker_manager: Arc<WorkerManager>,
        master: Arc<dyn MasterClient>,
        conf: RiffleConfig,
    ) -> Self {
        Self {
            worker_manager,
            master,
            conf,
            total_written: AtomicU64::new(0),
            file_count: AtomicU64::new(0),
        }
    }

    /// Bytes written across every committed shuffle of the application
    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    /// Files committed across every shuffle of the application
    pub fn file_count(&self) -> u64 {
        self.file_count.load(Ordering::Relaxed)
    }

    /// Drive the commit barrier of one shuffle to completion. Runs at most
    /// once per shuffle; duplicate invocations return immediately.
    pub async fn handle_stage_end(&self, app_id: &str, shuffle: &Arc<ShuffleState>) {
        if !shuffle.is_registered() {
            // an empty stage: nothing to commit, but reducers must not block
            if shuffle.try_begin_stage_end() {
                info!(
                    "Stage end of unregistered shuffle {}, marking it ended",
                    shuffle.shuffle_id
                );
                shuffle.finish_stage_end(false);
            }
            return;
        }

        if !shuffle.try_begin_stage_end() {
            debug!(
                "Stage end of shuffle {} already running or done",
                shuffle.shuffle_id
            );
            return;
        }

        let locations = shuffle.worker_locations();
        let attempts = shuffle.mapper_attempts_snapshot();
        let gather = self
            .commit_files(app_id, shuffle.shuffle_id, &locations, attempts)
            .await;

        // worker-side state of this shuffle is finished either way
        shuffle.clear_worker_locations();
        let release = ReleaseSlotsRequest::release_all(app_id, shuffle.shuffle_id);
        if let Err(e) = self.master.release_slots(release).await {
            warn!(
                "Failed to release slots of shuffle {} at the master: {}",
                shuffle.shuffle_id, e
            );
        }

        let data_lost = self.determine_data_loss(shuffle.shuffle_id, &gather);
        if !data_lost {
            let groups = assemble_file_groups(shuffle, &locations, &gather);
            shuffle.set_file_groups(groups);
        }
        shuffle.finish_stage_end(data_lost);
        info!(
            "Stage end of shuffle {} finished, data lost: {}",
            shuffle.shuffle_id, data_lost
        );
    }

    async fn commit_files(
        &self,
        app_id: &str,
        shuffle_id: u32,
        locations: &HashMap<WorkerInfo, PartitionLocationInfo>,
        attempts: Vec<i32>,
    ) -> CommitGather {
        let mut gather = CommitGather::default();
        if locations.is_empty() {
            return gather;
        }

        let parallelism = locations
            .len()
            .max(1)
            .min(self.conf.rpc_max_parallelism().max(1) as usize);

        let mut pending: Vec<(WorkerInfo, CommitFilesRequest)> = locations
            .iter()
            .map(|(worker, info)| {
                (
                    worker.clone(),
                    CommitFilesRequest {
                        app_id: app_id.to_owned(),
                        shuffle_id,
                        primary_ids: info.primary_unique_ids(),
                        replica_ids: info.replica_unique_ids(),
                        mapper_attempts: attempts.clone(),
                    },
                )
            })
            .collect();

        let mut requests = FuturesUnordered::new();
        let mut results: Vec<(WorkerInfo, CommitFilesRequest, Result<CommitFilesResponse>)> =
            vec![];
        loop {
            while requests.len() < parallelism {
                match pending.pop() {
                    Some((worker, request)) => requests.push(self.commit_one(worker, request)),
                    None => break,
                }
            }
            match requests.next().await {
                Some(result) => results.push(result),
                None => break,
            }
        }

        for (worker, request, result) in results {
            match result {
                Ok(response) => {
                    if !response.status.is_success() {
                        // partially failed and confused workers alike are not
                        // trusted with new allocations
                        warn!(
                            "Worker {} reported {:?} for commit of shuffle {}",
                            worker, response.status, shuffle_id
                        );
                        self.worker_manager.add_to_blacklist(&worker);
                    }
                    self.total_written
                        .fetch_add(response.total_written, Ordering::Relaxed);
                    self.file_count
                        .fetch_add(response.file_count, Ordering::Relaxed);

                    gather.failed_primary.extend(response.failed_primary_ids);
                    gather.failed_replica.extend(response.failed_replica_ids);
                    for uid in response.committed_primary_ids {
                        let storage = response
                            .committed_primary_storage
                            .get(&uid)
                            .cloned()
                            .unwrap_or_default();
                        gather.committed_primary.insert(uid, storage);
                    }
                    for uid in response.committed_replica_ids {
                        let storage = response
                            .committed_replica_storage
                            .get(&uid)
                            .cloned()
                            .unwrap_or_default();
                        gather.committed_replica.insert(uid, storage);
                    }
                    gather.committed_map_ids.extend(response.committed_map_ids);
                }
                Err(e) => {
                    warn!(
                        "Commit of shuffle {} on worker {} failed: {}",
                        shuffle_id, worker, e
                    );
                    self.worker_manager.add_to_blacklist(&worker);
                    gather.failed_primary.extend(request.primary_ids);
                    gather.failed_replica.extend(request.replica_ids);
                }
            }
        }
        gather
    }

    async fn commit_one(
        &self,
        worker: WorkerInfo,
        request: CommitFilesRequest,
    ) -> (WorkerInfo, CommitFilesRequest, Result<CommitFilesResponse>) {
        let result = match self.worker_manager.get_client(&worker).await {
            Ok(client) => client.commit_files(request.clone()).await,
            Err(e) => Err(e),
        };
        (worker, request, result)
    }

    fn determine_data_loss(&self, shuffle_id: u32, gather: &CommitGather) -> bool {
        if self.conf.replicate() {
            for uid in &gather.failed_primary {
                if gather.failed_replica.contains(uid) {
                    warn!(
                        "Partition {} of shuffle {} lost both locations",
                        uid, shuffle_id
                    );
                    return true;
                }
            }
            false
        } else {
            if let Some(uid) = gather.failed_primary.iter().next() {
                warn!(
                    "Partition {} of shuffle {} failed to commit without a replica",
                    uid, shuffle_id
                );
                return true;
            }
            false
        }
    }
}

/// Build the reducer file groups out of the committed locations. For every
/// partition the committed primary is published; when only the replica
/// survived, the replica is published instead so reducers always have a
/// usable location.
fn assemble_file_groups(
    shuffle: &Arc<ShuffleState>,
    locations: &HashMap<WorkerInfo, PartitionLocationInfo>,
    gather: &CommitGather,
) -> Vec<Vec<PartitionLocation>> {
    let num_partitions = shuffle
        .meta()
        .map(|m| m.num_partitions as usize)
        .unwrap_or(0);
    let mut groups: Vec<Vec<PartitionLocation>> = vec![vec![]; num_partitions];

    let mut primaries: HashMap<String, PartitionLocation> = HashMap::new();
    let mut replicas: HashMap<String, PartitionLocation> = HashMap::new();
    for info in locations.values() {
        for primary in &info.primaries {
            primaries.insert(primary.unique_id(), primary.clone());
        }
        for replica in &info.replicas {
            replicas.insert(replica.unique_id(), replica.clone());
        }
    }

    let publish = |groups: &mut Vec<Vec<PartitionLocation>>, mut location: PartitionLocation| {
        let partition_id = location.id as usize;
        if partition_id >= groups.len() {
            warn!(
                "Committed partition {} outside the id space of shuffle {}",
                location.unique_id(),
                shuffle.shuffle_id
            );
            return;
        }
        location.committed_map_ids = gather
            .committed_map_ids
            .get(&location.unique_id())
            .cloned()
            .unwrap_or_default();
        groups[partition_id].push(location);
    };

    for (uid, storage) in &gather.committed_primary {
        if let Some(primary) = primaries.get(uid) {
            let mut primary = primary.clone();
            primary.storage_info = storage.clone();
            if let Some(replica_storage) = gather.committed_replica.get(uid) {
                // both sides survived: publish the primary with its committed
                // peer wired in
                if let Some(replica) = replicas.get(uid) {
                    let mut replica = replica.clone();
                    replica.storage_info = replica_storage.clone();
                    primary = primary.with_peer(&replica);
                }
            }
            publish(&mut groups, primary);
        }
    }

    for (uid, storage) in &gather.committed_replica {
        if gather.committed_primary.contains_key(uid) {
            continue;
        }
        // only the replica survived; it becomes the readable location
        if let Some(replica) = replicas.get(uid) {
            let mut replica = replica.clone();
            replica.storage_info = storage.clone();
            publish(&mut groups, replica);
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    use riffle_core::config::RIFFLE_REPLICATE;
    use riffle_core::meta::PartitionMode;

    use crate::state::shuffle_manager::{ShuffleManager, ShuffleMeta};
    use crate::state::slot_allocator::{allocate, PartitionSpec};
    use crate::state::shuffle_manager::StageEndState;
    use crate::test_utils::TestCluster;

    fn stage_manager(cluster: &Arc<TestCluster>, replicate: bool) -> StageManager {
        let conf = RiffleConfig::builder()
            .set(RIFFLE_REPLICATE, if replicate { "true" } else { "false" })
            .build()
            .unwrap();
        StageManager::new(
            Arc::new(WorkerManager::new(cluster.worker_factory())),
            cluster.master(),
            conf,
        )
    }

    /// Register a shuffle over the given cluster and reserve its slots on
    /// the test workers so commit has something to find.
    fn prepared_shuffle(
        cluster: &Arc<TestCluster>,
        manager: &ShuffleManager,
        shuffle_id: u32,
        num_partitions: u32,
        replicate: bool,
    ) -> Arc<ShuffleState> {
        let specs: Vec<PartitionSpec> = (0..num_partitions).map(PartitionSpec::initial).collect();
        let resource = allocate(&cluster.workers, &specs, replicate).unwrap();

        // mimic a successful reservation on the workers
        for (worker, (primaries, replicas)) in &resource {
            cluster.reserve_for_test(worker, shuffle_id, primaries.clone(), replicas.clone());
        }

        let state = manager.get_or_create(shuffle_id);
        let mut allocated = HashMap::new();
        let mut initial_primaries = vec![];
        for (worker, (primaries, replicas)) in resource {
            let info = allocated
                .entry(worker)
                .or_insert_with(PartitionLocationInfo::default);
            for primary in primaries {
                initial_primaries.push(primary.clone());
                info.add_primary(primary);
            }
            for replica in replicas {
                info.add_replica(replica);
            }
        }
        state.complete(
            ShuffleMeta {
                num_mappers: 2,
                num_reducers: num_partitions,
                num_partitions,
                partition_type: riffle_core::meta::PartitionType::Reduce,
            },
            initial_primaries,
            allocated,
        );
        state.record_mapper_end(0, 0, 2);
        state.record_mapper_end(1, 0, 2);
        state
    }

    #[tokio::test]
    async fn commit_success_publishes_file_groups() {
        let cluster = TestCluster::new(3);
        let shuffles = ShuffleManager::new();
        let stage = stage_manager(&cluster, false);

        let state = prepared_shuffle(&cluster, &shuffles, 1, 8, false);
        stage.handle_stage_end("app-1", &state).await;

        assert_eq!(StageEndState::Done, state.stage_end_state());
        let groups = state.file_groups();
        assert_eq!(8, groups.len());
        for group in &groups {
            assert_eq!(1, group.len());
            assert_eq!(PartitionMode::Primary, group[0].mode);
            assert!(!group[0].storage_info.mount_point.is_empty());
            assert_eq!(vec![0, 1], group[0].committed_map_ids);
        }
        // worker-side state was released
        assert!(!state.has_allocated_locations());
        assert!(stage.total_written() > 0);
        assert!(stage.file_count() > 0);
    }

    #[tokio::test]
    async fn both_locations_lost_means_data_loss() {
        let cluster = TestCluster::new(3);
        let shuffles = ShuffleManager::new();
        let stage = stage_manager(&cluster, true);

        let state = prepared_shuffle(&cluster, &shuffles, 1, 8, true);
        // partition 7: both the primary and the replica fail to commit
        let target = state.latest_location(7).unwrap();
        cluster.fail_commit_location(&target.worker, &target.unique_id(), PartitionMode::Primary);
        let replica_worker = target.peer().unwrap().worker.clone();
        cluster.fail_commit_location(&replica_worker, &target.unique_id(), PartitionMode::Replica);

        stage.handle_stage_end("app-1", &state).await;

        assert_eq!(StageEndState::DataLost, state.stage_end_state());
        // both underperforming workers are blacklisted
        let manager = &stage.worker_manager;
        assert!(manager.is_blacklisted(&target.worker));
        assert!(manager.is_blacklisted(&replica_worker));
    }

    #[tokio::test]
    async fn replica_survives_primary_failure() {
        let cluster = TestCluster::new(3);
        let shuffles = ShuffleManager::new();
        let stage = stage_manager(&cluster, true);

        let state = prepared_shuffle(&cluster, &shuffles, 1, 8, true);
        // partition 2 fails on the primary only
        let target = state.latest_location(2).unwrap();
        cluster.fail_commit_location(&target.worker, &target.unique_id(), PartitionMode::Primary);

        stage.handle_stage_end("app-1", &state).await;

        assert_eq!(StageEndState::Done, state.stage_end_state());
        let groups = state.file_groups();
        assert_eq!(1, groups[2].len());
        assert_eq!(PartitionMode::Replica, groups[2][0].mode);
        assert_ne!(target.worker, groups[2][0].worker);
        // the other partitions are published through their primaries with
        // the committed replica wired as peer
        assert_eq!(PartitionMode::Primary, groups[0][0].mode);
        assert_eq!(
            PartitionMode::Replica,
            groups[0][0].peer().map(|p| p.mode).unwrap()
        );
    }

    #[tokio::test]
    async fn stage_end_runs_once() {
        let cluster = TestCluster::new(2);
        let shuffles = ShuffleManager::new();
        let stage = stage_manager(&cluster, false);

        let state = prepared_shuffle(&cluster, &shuffles, 1, 4, false);
        stage.handle_stage_end("app-1", &state).await;
        let commits_after_first = cluster.commit_calls();

        stage.handle_stage_end("app-1", &state).await;
        assert_eq!(commits_after_first, cluster.commit_calls());
        assert_eq!(StageEndState::Done, state.stage_end_state());
    }

    #[tokio::test]
    async fn unregistered_shuffle_is_marked_ended() {
        let cluster = TestCluster::new(1);
        let shuffles = ShuffleManager::new();
        let stage = stage_manager(&cluster, false);

        let state = shuffles.get_or_create(9);
        stage.handle_stage_end("app-1", &state).await;

        assert_eq!(StageEndState::Done, state.stage_end_state());
        assert_eq!(0, cluster.commit_calls());
    }
}
