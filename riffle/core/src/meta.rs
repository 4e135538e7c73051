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

//! Shared meta-data types describing workers and partition locations

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a storage worker. Two `WorkerInfo` values are the same worker
/// iff the whole `(host, rpc_port, push_port, fetch_port, replicate_port)`
/// tuple matches; connection state is tracked separately and never feeds
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub host: String,
    pub rpc_port: u16,
    pub push_port: u16,
    pub fetch_port: u16,
    pub replicate_port: u16,
}

impl WorkerInfo {
    pub fn new(
        host: impl Into<String>,
        rpc_port: u16,
        push_port: u16,
        fetch_port: u16,
        replicate_port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            rpc_port,
            push_port,
            fetch_port,
            replicate_port,
        }
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.host, self.rpc_port, self.push_port, self.fetch_port, self.replicate_port
        )
    }
}

/// Mode of a partition location. Writers push to the primary, which mirrors
/// to its replica on a different worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionMode {
    Primary,
    Replica,
}

impl PartitionMode {
    pub fn peer(&self) -> PartitionMode {
        match self {
            PartitionMode::Primary => PartitionMode::Replica,
            PartitionMode::Replica => PartitionMode::Primary,
        }
    }
}

/// Storage hint attached to a committed partition by the worker that holds it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub mount_point: String,
}

impl StorageInfo {
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
        }
    }
}

/// One placement of a shuffle partition on a worker.
///
/// `epoch` is bumped every time the partition is replaced (revive/split), and
/// is strictly monotone per partition id within a shuffle. When replication
/// is enabled the peer field carries a one-level copy of the counterpart
/// location; the copy's own `peer` is always `None`, so no reference cycle
/// exists and symmetric data is simply duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLocation {
    pub id: u32,
    pub epoch: u32,
    pub worker: WorkerInfo,
    pub mode: PartitionMode,
    pub storage_info: StorageInfo,
    /// Map ids whose data was committed into this location; filled at stage
    /// end, empty before that
    pub committed_map_ids: Vec<u32>,
    pub peer: Option<Box<PartitionLocation>>,
}

impl PartitionLocation {
    pub fn new(id: u32, epoch: u32, worker: WorkerInfo, mode: PartitionMode) -> Self {
        Self {
            id,
            epoch,
            worker,
            mode,
            storage_info: StorageInfo::default(),
            committed_map_ids: vec![],
            peer: None,
        }
    }

    /// Identifier unique within a shuffle: `"{id}-{epoch}"`
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.id, self.epoch)
    }

    /// True iff `other` is the replication counterpart of this location:
    /// same partition and epoch, opposite mode, on a different worker.
    pub fn is_peer_of(&self, other: &PartitionLocation) -> bool {
        self.id == other.id
            && self.epoch == other.epoch
            && self.mode == other.mode.peer()
            && self.worker != other.worker
    }

    /// Attach `peer` as the counterpart of this location. The stored copy is
    /// flattened to one level.
    pub fn with_peer(mut self, peer: &PartitionLocation) -> Self {
        let mut flat = peer.clone();
        flat.peer = None;
        self.peer = Some(Box::new(flat));
        self
    }

    pub fn peer(&self) -> Option<&PartitionLocation> {
        self.peer.as_deref()
    }
}

/// A computed allocation, not yet reserved on any worker: for every chosen
/// worker, the primary and replica locations it should host.
pub type WorkerResource = HashMap<WorkerInfo, (Vec<PartitionLocation>, Vec<PartitionLocation>)>;

/// Determines the id space used for slot requests: one slot per reducer for
/// reduce partitions, one per mapper for map partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    Reduce,
    Map,
}

impl PartitionType {
    pub fn num_partitions(&self, num_mappers: u32, num_reducers: u32) -> u32 {
        match self {
            PartitionType::Reduce => num_reducers,
            PartitionType::Map => num_mappers,
        }
    }
}

/// Split behavior forwarded to workers at reserve time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMode {
    Soft,
    Hard,
}

/// Identity of the tenant an application runs as; threaded through slot
/// requests and quota checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentifier {
    pub tenant: String,
    pub name: String,
}

impl Default for UserIdentifier {
    fn default() -> Self {
        Self {
            tenant: "default".to_owned(),
            name: "default".to_owned(),
        }
    }
}

impl fmt::Display for UserIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.name)
    }
}
