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

//! Control-plane message payloads exchanged between tasks, the coordinator,
//! the cluster master and the storage workers. Wire encoding and transport
//! live outside this crate; these are the typed payloads the RPC facade
//! carries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::meta::{
    PartitionLocation, PartitionType, SplitMode, StorageInfo, UserIdentifier, WorkerInfo,
    WorkerResource,
};

/// Reply status shared by all control-plane responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    Failed,
    SlotNotAvailable,
    ReserveSlotsFailed,
    ShuffleNotRegistered,
    MapEnded,
    StageEndTimeout,
    ShuffleDataLost,
    PartialSuccess,
    MasterUnreachable,
    WorkerNotRegistered,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Success
    }
}

/// Why a task asked for a partition to be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviveCause {
    PrimaryPushFailure,
    ReplicaPushFailure,
    PushTimeout,
    Unknown,
}

/// Key identifying one shuffle of one application on workers and the master
pub fn shuffle_key(app_id: &str, shuffle_id: u32) -> String {
    format!("{}-{}", app_id, shuffle_id)
}

// ---------------------------------------------------------------------------
// Task-facing messages (inbound)
// ---------------------------------------------------------------------------

/// Every request a compute task can send to the coordinator endpoint.
/// The endpoint routes on the tag; correlation with replies is a transport
/// concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    RegisterShuffle {
        app_id: String,
        shuffle_id: u32,
        num_mappers: u32,
        num_reducers: u32,
    },
    Revive {
        app_id: String,
        shuffle_id: u32,
        map_id: u32,
        attempt_id: i32,
        partition_id: u32,
        epoch: u32,
        old_location: Option<PartitionLocation>,
        cause: ReviveCause,
    },
    PartitionSplit {
        app_id: String,
        shuffle_id: u32,
        partition_id: u32,
        epoch: u32,
        old_location: PartitionLocation,
    },
    MapperEnd {
        app_id: String,
        shuffle_id: u32,
        map_id: u32,
        attempt_id: i32,
        num_mappers: u32,
    },
    GetReducerFileGroup {
        app_id: String,
        shuffle_id: u32,
    },
    StageEnd {
        app_id: String,
        shuffle_id: u32,
    },
    UnregisterShuffle {
        app_id: String,
        shuffle_id: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterShuffleResponse {
    pub status: StatusCode,
    /// Epoch-0 primary locations on success, empty otherwise
    pub partition_locations: Vec<PartitionLocation>,
}

impl RegisterShuffleResponse {
    pub fn failed(status: StatusCode) -> Self {
        Self {
            status,
            partition_locations: vec![],
        }
    }
}

/// Reply to both `Revive` and `PartitionSplit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLocationResponse {
    pub status: StatusCode,
    pub location: Option<PartitionLocation>,
}

impl ChangeLocationResponse {
    pub fn failed(status: StatusCode) -> Self {
        Self {
            status,
            location: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MapperEndResponse {
    pub status: StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReducerFileGroupResponse {
    pub status: StatusCode,
    /// `file_groups[partition_id]` lists every committed location holding
    /// data of that partition
    pub file_groups: Vec<Vec<PartitionLocation>>,
    /// Snapshot of ended mapper attempts, indexed by map id
    pub mapper_attempts: Vec<i32>,
}

impl GetReducerFileGroupResponse {
    pub fn failed(status: StatusCode) -> Self {
        Self {
            status,
            file_groups: vec![],
            mapper_attempts: vec![],
        }
    }
}

/// Typed union of every endpoint reply, mirroring [`ControlMessage`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    RegisterShuffle(RegisterShuffleResponse),
    ChangeLocation(ChangeLocationResponse),
    MapperEnd(MapperEndResponse),
    GetReducerFileGroup(GetReducerFileGroupResponse),
    /// Fire-and-forget messages acknowledge with a bare status
    Ack(StatusCode),
}

// ---------------------------------------------------------------------------
// Master-facing messages (outbound)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSlotsRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    pub partition_ids: Vec<u32>,
    pub coordinator_host: String,
    pub replicate: bool,
    pub user_identifier: UserIdentifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSlotsResponse {
    pub status: StatusCode,
    pub resource: WorkerResource,
}

/// Release slot quota at the master. Empty `worker_ids` releases everything
/// the shuffle holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSlotsRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    pub worker_ids: Vec<String>,
    pub slots_per_worker: Vec<u32>,
}

impl ReleaseSlotsRequest {
    pub fn release_all(app_id: &str, shuffle_id: u32) -> Self {
        Self {
            app_id: app_id.to_owned(),
            shuffle_id,
            worker_ids: vec![],
            slots_per_worker: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlacklistResponse {
    pub status: StatusCode,
    pub blacklist: Vec<WorkerInfo>,
    pub unknown_workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFromApplication {
    pub app_id: String,
    pub total_written: u64,
    pub file_count: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckQuotaResponse {
    pub available: bool,
}

// ---------------------------------------------------------------------------
// Worker-facing messages (outbound)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSlotsRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    pub primary_locations: Vec<PartitionLocation>,
    pub replica_locations: Vec<PartitionLocation>,
    pub split_threshold: u64,
    pub split_mode: SplitMode,
    pub partition_type: PartitionType,
    pub range_read_filter: bool,
    pub user_identifier: UserIdentifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSlotsResponse {
    pub status: StatusCode,
    pub reason: String,
}

impl ReserveSlotsResponse {
    pub fn success() -> Self {
        Self {
            status: StatusCode::Success,
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFilesRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    /// Unique ids of the primary locations the worker should commit
    pub primary_ids: Vec<String>,
    /// Unique ids of the replica locations the worker should commit
    pub replica_ids: Vec<String>,
    /// Snapshot of ended mapper attempts, used by workers to drop data of
    /// speculative attempts
    pub mapper_attempts: Vec<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitFilesResponse {
    pub status: StatusCode,
    pub committed_primary_ids: Vec<String>,
    pub committed_replica_ids: Vec<String>,
    pub failed_primary_ids: Vec<String>,
    pub failed_replica_ids: Vec<String>,
    /// Storage hint per committed unique id
    pub committed_primary_storage: HashMap<String, StorageInfo>,
    pub committed_replica_storage: HashMap<String, StorageInfo>,
    /// Map ids whose data made it into each committed partition
    pub committed_map_ids: HashMap<String, Vec<u32>>,
    pub total_written: u64,
    pub file_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub shuffle_key: String,
    pub primary_unique_ids: Vec<String>,
    pub replica_unique_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResponse {
    pub status: StatusCode,
    pub failed_primary_ids: Vec<String>,
    pub failed_replica_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_keys() {
        assert_eq!("app-1-4", shuffle_key("app-1", 4));
    }

    #[test]
    fn status_code() {
        assert!(StatusCode::Success.is_success());
        assert!(!StatusCode::PartialSuccess.is_success());
    }
}
