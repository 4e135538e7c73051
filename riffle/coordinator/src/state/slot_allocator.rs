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

//! Pure slot allocation: map partitions onto candidate workers.
//!
//! Placement is random on purpose. Retries after a reservation failure must
//! not keep hammering the same worker, and random primary indices spread
//! load without any coordination; the replica always sits on the ring
//! neighbour of the primary so a pair can never be colocated.

use rand::Rng;

use riffle_core::error::{Result, RiffleError};
use riffle_core::meta::{PartitionLocation, PartitionMode, WorkerInfo, WorkerResource};

/// A partition to place, together with the epoch its new location gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    pub partition_id: u32,
    pub epoch: u32,
}

impl PartitionSpec {
    /// First placement of a partition at registration time
    pub fn initial(partition_id: u32) -> Self {
        Self {
            partition_id,
            epoch: 0,
        }
    }

    /// Re-placement after a reservation failure: same epoch, new worker
    pub fn retry(partition_id: u32, epoch: u32) -> Self {
        Self {
            partition_id,
            epoch,
        }
    }

    /// Replacement requested by a task (revive or split): the epoch is bumped
    pub fn renewal(partition_id: u32, old_epoch: u32) -> Self {
        Self {
            partition_id,
            epoch: old_epoch + 1,
        }
    }
}

/// Place every partition in `specs` on the candidate workers, producing a
/// not-yet-reserved [`WorkerResource`].
///
/// Requires at least one candidate, or two when `replicate` is set so the
/// replica lands on a different worker than its primary.
pub fn allocate(
    candidates: &[WorkerInfo],
    specs: &[PartitionSpec],
    replicate: bool,
) -> Result<WorkerResource> {
    let required = if replicate { 2 } else { 1 };
    if candidates.len() < required {
        return Err(RiffleError::InsufficientCandidates {
            required,
            available: candidates.len(),
        });
    }

    let mut rng = rand::thread_rng();
    let mut resource = WorkerResource::new();
    for spec in specs {
        let primary_idx = rng.gen_range(0..candidates.len());
        let primary_worker = &candidates[primary_idx];
        let primary = PartitionLocation::new(
            spec.partition_id,
            spec.epoch,
            primary_worker.clone(),
            PartitionMode::Primary,
        );

        if replicate {
            let replica_worker = &candidates[(primary_idx + 1) % candidates.len()];
            let replica = PartitionLocation::new(
                spec.partition_id,
                spec.epoch,
                replica_worker.clone(),
                PartitionMode::Replica,
            );

            resource
                .entry(primary_worker.clone())
                .or_insert_with(|| (vec![], vec![]))
                .0
                .push(primary.clone().with_peer(&replica));
            resource
                .entry(replica_worker.clone())
                .or_insert_with(|| (vec![], vec![]))
                .1
                .push(replica.with_peer(&primary));
        } else {
            resource
                .entry(primary_worker.clone())
                .or_insert_with(|| (vec![], vec![]))
                .0
                .push(primary);
        }
    }

    Ok(resource)
}
