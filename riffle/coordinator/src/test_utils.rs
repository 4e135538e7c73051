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

//! In-memory master and worker backends for coordinator tests, with
//! scriptable failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use riffle_core::error::{Result, RiffleError};
use riffle_core::messages::{
    CheckQuotaResponse, CommitFilesRequest, CommitFilesResponse, DestroyRequest, DestroyResponse,
    GetBlacklistResponse, HeartbeatFromApplication, ReleaseSlotsRequest, RequestSlotsRequest,
    RequestSlotsResponse, ReserveSlotsRequest, ReserveSlotsResponse, StatusCode,
};
use riffle_core::meta::{
    PartitionLocation, PartitionMode, StorageInfo, UserIdentifier, WorkerInfo,
};
use riffle_core::rpc::{MasterClient, WorkerClient, WorkerClientFactory};

use crate::coordinator_server::CoordinatorServer;
use crate::metrics::default_metrics_collector;
use crate::state::slot_allocator::{allocate, PartitionSpec};
use crate::state::CoordinatorState;

pub const TEST_MOUNT_POINT: &str = "/mnt/disk1";
pub const TEST_BYTES_PER_PARTITION: u64 = 1024;

pub fn test_workers(n: usize) -> Vec<WorkerInfo> {
    (0..n)
        .map(|i| WorkerInfo::new(format!("host-{}", i), 9090, 9091, 9092, 9093))
        .collect()
}

pub fn test_app_id() -> String {
    format!("app-{}", uuid::Uuid::new_v4())
}

#[derive(Default)]
struct ClusterInner {
    fail_connect: HashSet<WorkerInfo>,
    fail_reserve: HashSet<WorkerInfo>,
    hang_commit: HashSet<WorkerInfo>,
    fail_commit_locations: HashMap<(WorkerInfo, PartitionMode), HashSet<String>>,
    reserved: HashMap<(WorkerInfo, u32), (Vec<PartitionLocation>, Vec<PartitionLocation>)>,
    destroyed: Vec<(WorkerInfo, DestroyRequest)>,
    released: Vec<ReleaseSlotsRequest>,
    unregistered: Vec<(String, u32)>,
    heartbeats: Vec<HeartbeatFromApplication>,
    quota_available: bool,
    slot_requests: usize,
    reserve_calls: usize,
    commit_calls: usize,
}

/// A scriptable in-memory shuffle cluster: one master, `n` workers
pub struct TestCluster {
    pub workers: Vec<WorkerInfo>,
    inner: Mutex<ClusterInner>,
}

impl TestCluster {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            workers: test_workers(n),
            inner: Mutex::new(ClusterInner {
                quota_available: true,
                ..ClusterInner::default()
            }),
        })
    }

    pub fn master(self: &Arc<Self>) -> Arc<dyn MasterClient> {
        Arc::new(TestMaster {
            cluster: self.clone(),
        })
    }

    pub fn worker_factory(self: &Arc<Self>) -> Arc<dyn WorkerClientFactory> {
        Arc::new(TestWorkerFactory {
            cluster: self.clone(),
        })
    }

    // -- failure scripting ---------------------------------------------------

    pub fn fail_connect_on(&self, worker: &WorkerInfo) {
        self.inner.lock().fail_connect.insert(worker.clone());
    }

    pub fn fail_reserve_on(&self, worker: &WorkerInfo) {
        self.inner.lock().fail_reserve.insert(worker.clone());
    }

    pub fn hang_commit_on(&self, worker: &WorkerInfo) {
        self.inner.lock().hang_commit.insert(worker.clone());
    }

    pub fn fail_commit_location(&self, worker: &WorkerInfo, unique_id: &str, mode: PartitionMode) {
        self.inner
            .lock()
            .fail_commit_locations
            .entry((worker.clone(), mode))
            .or_default()
            .insert(unique_id.to_owned());
    }

    pub fn set_quota(&self, available: bool) {
        self.inner.lock().quota_available = available;
    }

    // -- bookkeeping ---------------------------------------------------------

    pub fn reserved_primaries(&self, worker: &WorkerInfo, shuffle_id: u32) -> Vec<PartitionLocation> {
        self.inner
            .lock()
            .reserved
            .get(&(worker.clone(), shuffle_id))
            .map(|(primaries, _)| primaries.clone())
            .unwrap_or_default()
    }

    /// Prime a reservation without going through the RPC path
    pub fn reserve_for_test(
        &self,
        worker: &WorkerInfo,
        shuffle_id: u32,
        primaries: Vec<PartitionLocation>,
        replicas: Vec<PartitionLocation>,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner
            .reserved
            .entry((worker.clone(), shuffle_id))
            .or_default();
        entry.0.extend(primaries);
        entry.1.extend(replicas);
    }

    pub fn destroyed(&self) -> Vec<(WorkerInfo, DestroyRequest)> {
        self.inner.lock().destroyed.clone()
    }

    /// Destroys run on detached tasks; give them a moment to land
    pub async fn wait_for_destroys(&self) {
        for _ in 0..200 {
            if !self.inner.lock().destroyed.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn released(&self) -> Vec<ReleaseSlotsRequest> {
        self.inner.lock().released.clone()
    }

    pub fn unregistered(&self) -> Vec<(String, u32)> {
        self.inner.lock().unregistered.clone()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatFromApplication> {
        self.inner.lock().heartbeats.clone()
    }

    pub fn slot_requests(&self) -> usize {
        self.inner.lock().slot_requests
    }

    pub fn reserve_calls(&self) -> usize {
        self.inner.lock().reserve_calls
    }

    pub fn commit_calls(&self) -> usize {
        self.inner.lock().commit_calls
    }
}

struct TestMaster {
    cluster: Arc<TestCluster>,
}

#[async_trait]
impl MasterClient for TestMaster {
    async fn request_slots(&self, request: RequestSlotsRequest) -> Result<RequestSlotsResponse> {
        self.cluster.inner.lock().slot_requests += 1;
        let specs: Vec<PartitionSpec> = request
            .partition_ids
            .iter()
            .map(|id| PartitionSpec::initial(*id))
            .collect();
        match allocate(&self.cluster.workers, &specs, request.replicate) {
            Ok(resource) => Ok(RequestSlotsResponse {
                status: StatusCode::Success,
                resource,
            }),
            Err(_) => Ok(RequestSlotsResponse {
                status: StatusCode::SlotNotAvailable,
                resource: Default::default(),
            }),
        }
    }

    async fn release_slots(&self, request: ReleaseSlotsRequest) -> Result<()> {
        self.cluster.inner.lock().released.push(request);
        Ok(())
    }

    async fn get_blacklist(&self, _current: Vec<WorkerInfo>) -> Result<GetBlacklistResponse> {
        Ok(GetBlacklistResponse {
            status: StatusCode::Success,
            blacklist: vec![],
            unknown_workers: vec![],
        })
    }

    async fn unregister_shuffle(&self, app_id: &str, shuffle_id: u32) -> Result<()> {
        self.cluster
            .inner
            .lock()
            .unregistered
            .push((app_id.to_owned(), shuffle_id));
        Ok(())
    }

    async fn heartbeat_from_application(&self, heartbeat: HeartbeatFromApplication) -> Result<()> {
        self.cluster.inner.lock().heartbeats.push(heartbeat);
        Ok(())
    }

    async fn check_quota(&self, _user: &UserIdentifier) -> Result<CheckQuotaResponse> {
        Ok(CheckQuotaResponse {
            available: self.cluster.inner.lock().quota_available,
        })
    }
}

struct TestWorkerFactory {
    cluster: Arc<TestCluster>,
}

#[async_trait]
impl WorkerClientFactory for TestWorkerFactory {
    async fn create(&self, worker: &WorkerInfo) -> Result<Arc<dyn WorkerClient>> {
        if self.cluster.inner.lock().fail_connect.contains(worker) {
            return Err(RiffleError::internal("connection refused"));
        }
        Ok(Arc::new(TestWorkerClient {
            cluster: self.cluster.clone(),
            worker: worker.clone(),
        }))
    }
}

struct TestWorkerClient {
    cluster: Arc<TestCluster>,
    worker: WorkerInfo,
}

impl TestWorkerClient {
    fn failed_ids(&self, mode: PartitionMode) -> HashSet<String> {
        self.cluster
            .inner
            .lock()
            .fail_commit_locations
            .get(&(self.worker.clone(), mode))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkerClient for TestWorkerClient {
    async fn reserve_slots(&self, request: ReserveSlotsRequest) -> Result<ReserveSlotsResponse> {
        let mut inner = self.cluster.inner.lock();
        inner.reserve_calls += 1;
        if inner.fail_reserve.contains(&self.worker) {
            return Ok(ReserveSlotsResponse {
                status: StatusCode::Failed,
                reason: "injected reserve failure".to_owned(),
            });
        }
        let entry = inner
            .reserved
            .entry((self.worker.clone(), request.shuffle_id))
            .or_default();
        entry.0.extend(request.primary_locations);
        entry.1.extend(request.replica_locations);
        Ok(ReserveSlotsResponse::success())
    }

    async fn commit_files(&self, request: CommitFilesRequest) -> Result<CommitFilesResponse> {
        let (hang, known) = {
            let mut inner = self.cluster.inner.lock();
            inner.commit_calls += 1;
            let known: HashSet<String> = inner
                .reserved
                .get(&(self.worker.clone(), request.shuffle_id))
                .map(|(primaries, replicas)| {
                    primaries
                        .iter()
                        .chain(replicas.iter())
                        .map(|location| location.unique_id())
                        .collect()
                })
                .unwrap_or_default();
            (inner.hang_commit.contains(&self.worker), known)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let committed_map_ids: Vec<u32> = request
            .mapper_attempts
            .iter()
            .enumerate()
            .filter(|(_, attempt)| **attempt >= 0)
            .map(|(map_id, _)| map_id as u32)
            .collect();

        let mut response = CommitFilesResponse::default();
        let failed_primaries = self.failed_ids(PartitionMode::Primary);
        for uid in request.primary_ids {
            if failed_primaries.contains(&uid) || !known.contains(&uid) {
                response.failed_primary_ids.push(uid);
            } else {
                response
                    .committed_primary_storage
                    .insert(uid.clone(), StorageInfo::new(TEST_MOUNT_POINT));
                response
                    .committed_map_ids
                    .insert(uid.clone(), committed_map_ids.clone());
                response.committed_primary_ids.push(uid);
                response.total_written += TEST_BYTES_PER_PARTITION;
                response.file_count += 1;
            }
        }
        let failed_replicas = self.failed_ids(PartitionMode::Replica);
        for uid in request.replica_ids {
            if failed_replicas.contains(&uid) || !known.contains(&uid) {
                response.failed_replica_ids.push(uid);
            } else {
                response
                    .committed_replica_storage
                    .insert(uid.clone(), StorageInfo::new(TEST_MOUNT_POINT));
                response
                    .committed_map_ids
                    .entry(uid.clone())
                    .or_insert_with(|| committed_map_ids.clone());
                response.committed_replica_ids.push(uid);
                response.total_written += TEST_BYTES_PER_PARTITION;
                response.file_count += 1;
            }
        }
        response.status =
            if response.failed_primary_ids.is_empty() && response.failed_replica_ids.is_empty() {
                StatusCode::Success
            } else {
                StatusCode::PartialSuccess
            };
        Ok(response)
    }

    async fn destroy(&self, request: DestroyRequest) -> Result<DestroyResponse> {
        let mut inner = self.cluster.inner.lock();
        let dropped: HashSet<String> = request
            .primary_unique_ids
            .iter()
            .chain(request.replica_unique_ids.iter())
            .cloned()
            .collect();
        for (_, (primaries, replicas)) in inner.reserved.iter_mut() {
            primaries.retain(|p| !dropped.contains(&p.unique_id()));
            replicas.retain(|r| !dropped.contains(&r.unique_id()));
        }
        inner.destroyed.push((self.worker.clone(), request));
        Ok(DestroyResponse {
            status: StatusCode::Success,
            failed_primary_ids: vec![],
            failed_replica_ids: vec![],
        })
    }
}

/// A [`CoordinatorState`] wired against the test cluster
pub fn test_state(cluster: &Arc<TestCluster>, conf: riffle_core::config::RiffleConfig) -> CoordinatorState {
    CoordinatorState::new(
        test_app_id(),
        "localhost".to_owned(),
        conf,
        UserIdentifier::default(),
        cluster.master(),
        cluster.worker_factory(),
    )
}

/// A full [`CoordinatorServer`] wired against the test cluster
pub fn test_server(
    cluster: &Arc<TestCluster>,
    conf: riffle_core::config::RiffleConfig,
) -> CoordinatorServer {
    CoordinatorServer::new(
        test_app_id(),
        "localhost".to_owned(),
        conf,
        UserIdentifier::default(),
        cluster.master(),
        cluster.worker_factory(),
        default_metrics_collector(),
    )
}
