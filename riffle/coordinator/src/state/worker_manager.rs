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

//! Tracks which workers are usable and lazily resolves their endpoints.
//!
//! A [`WorkerInfo`] is pure identity. The connection handle lives in a
//! sidecar cache keyed by that identity and is only created the first time
//! the coordinator talks to the worker. Workers that fail to connect, fail a
//! reservation or fail a commit land in the blacklist and are never offered
//! to the allocator again until the master stops listing them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use riffle_core::error::{Result, RiffleError};
use riffle_core::meta::WorkerInfo;
use riffle_core::rpc::{MasterClient, WorkerClient, WorkerClientFactory};

pub struct WorkerManager {
    factory: Arc<dyn WorkerClientFactory>,
    clients: Mutex<HashMap<WorkerInfo, Arc<dyn WorkerClient>>>,
    blacklist: RwLock<HashSet<WorkerInfo>>,
    /// Workers whose endpoint could not be initialized locally. Kept apart
    /// from the blacklist: a refresh keeps these even when the master does
    /// not list them.
    connect_failed: RwLock<HashSet<WorkerInfo>>,
}

impl WorkerManager {
    pub fn new(factory: Arc<dyn WorkerClientFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            connect_failed: RwLock::new(HashSet::new()),
        }
    }

    /// Return the endpoint handle for `worker`, creating it on first use.
    /// A creation failure moves the worker to the blacklist.
    pub async fn get_client(&self, worker: &WorkerInfo) -> Result<Arc<dyn WorkerClient>> {
        if let Some(client) = self.clients.lock().get(worker) {
            return Ok(client.clone());
        }
        match self.factory.create(worker).await {
            Ok(client) => {
                // a concurrent initializer may have won the race; keep the
                // first handle so every caller shares one endpoint
                Ok(self
                    .clients
                    .lock()
                    .entry(worker.clone())
                    .or_insert(client)
                    .clone())
            }
            Err(e) => {
                warn!("Failed to init endpoint of worker {}: {}", worker, e);
                self.record_connect_failure(worker);
                Err(RiffleError::WorkerUnreachable {
                    worker: worker.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    pub fn add_to_blacklist(&self, worker: &WorkerInfo) {
        if self.blacklist.write().insert(worker.clone()) {
            info!("Worker {} added to the blacklist", worker);
        }
    }

    fn record_connect_failure(&self, worker: &WorkerInfo) {
        self.connect_failed.write().insert(worker.clone());
        self.add_to_blacklist(worker);
    }

    pub fn is_blacklisted(&self, worker: &WorkerInfo) -> bool {
        self.blacklist.read().contains(worker)
    }

    pub fn blacklist(&self) -> Vec<WorkerInfo> {
        self.blacklist.read().iter().cloned().collect()
    }

    /// Filter `candidates` down to workers the coordinator may still use
    pub fn usable_candidates(&self, candidates: &[WorkerInfo]) -> Vec<WorkerInfo> {
        let blacklist = self.blacklist.read();
        candidates
            .iter()
            .filter(|w| !blacklist.contains(w))
            .cloned()
            .collect()
    }

    /// Replace the blacklist with the union of locally observed connect
    /// failures, the master-published blacklist and workers the master no
    /// longer knows. A worker becomes eligible again only once the master
    /// stops listing it.
    pub async fn refresh_blacklist(&self, master: &dyn MasterClient) -> Result<()> {
        let current = self.blacklist();
        let response = master.get_blacklist(current).await?;

        let mut merged: HashSet<WorkerInfo> = self.connect_failed.read().iter().cloned().collect();
        merged.extend(response.blacklist.into_iter());
        merged.extend(response.unknown_workers.into_iter());

        let mut blacklist = self.blacklist.write();
        if *blacklist != merged {
            info!(
                "Blacklist refreshed from master, {} -> {} workers",
                blacklist.len(),
                merged.len()
            );
        }
        *blacklist = merged;
        Ok(())
    }
}
