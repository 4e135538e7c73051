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

//! Outbound RPC facade. Concrete transports implement these traits; the
//! coordinator only ever talks to the cluster through them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{
    CheckQuotaResponse, CommitFilesRequest, CommitFilesResponse, DestroyRequest, DestroyResponse,
    GetBlacklistResponse, HeartbeatFromApplication, ReleaseSlotsRequest, RequestSlotsRequest,
    RequestSlotsResponse, ReserveSlotsRequest, ReserveSlotsResponse,
};
use crate::meta::{UserIdentifier, WorkerInfo};

/// Client handle to the cluster master. Implementations are expected to
/// carry their own connection retry; the coordinator adds handler-level
/// retry only where the protocol calls for it.
#[async_trait]
pub trait MasterClient: Send + Sync + 'static {
    /// Ask the master for a worker slot offer covering `partition_ids`
    async fn request_slots(&self, request: RequestSlotsRequest) -> Result<RequestSlotsResponse>;

    /// Give slot quota back to the master. Best effort; failures are logged
    /// by callers and never propagated.
    async fn release_slots(&self, request: ReleaseSlotsRequest) -> Result<()>;

    /// Fetch the master-published blacklist, reporting the current local one
    async fn get_blacklist(&self, current: Vec<WorkerInfo>) -> Result<GetBlacklistResponse>;

    /// Tell the master the application is done with a shuffle
    async fn unregister_shuffle(&self, app_id: &str, shuffle_id: u32) -> Result<()>;

    /// Periodic application liveness + usage report
    async fn heartbeat_from_application(&self, heartbeat: HeartbeatFromApplication) -> Result<()>;

    /// Whether the user still has quota for new slot requests
    async fn check_quota(&self, user: &UserIdentifier) -> Result<CheckQuotaResponse>;
}

/// Client handle to one storage worker endpoint
#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// Reserve write buffers for the given primary/replica locations
    async fn reserve_slots(&self, request: ReserveSlotsRequest) -> Result<ReserveSlotsResponse>;

    /// Flush and seal the files of the given locations at stage end
    async fn commit_files(&self, request: CommitFilesRequest) -> Result<CommitFilesResponse>;

    /// Drop reserved buffers that will never be committed
    async fn destroy(&self, request: DestroyRequest) -> Result<DestroyResponse>;
}

/// Creates [`WorkerClient`] handles on demand. Endpoint resolution is lazy:
/// a `WorkerInfo` is pure identity and only gets a connection the first time
/// the coordinator needs to talk to it. A factory failure marks the worker
/// unusable (the caller records it into the blacklist).
#[async_trait]
pub trait WorkerClientFactory: Send + Sync + 'static {
    async fn create(&self, worker: &WorkerInfo) -> Result<Arc<dyn WorkerClient>>;
}
