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

//! The [`EventAction`] behind the coordinator event loop: stage-end commits
//! and expiration sweeps run here, one at a time, off the request path.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error, info};

use riffle_core::error::{Result, RiffleError};
use riffle_core::event_loop::EventAction;

use crate::coordinator_server::event::CoordinatorServerEvent;
use crate::metrics::CoordinatorMetricsCollector;
use crate::state::shuffle_manager::StageEndState;
use crate::state::CoordinatorState;

pub struct StageScheduler {
    state: Arc<CoordinatorState>,
    metrics_collector: Arc<dyn CoordinatorMetricsCollector>,
}

impl StageScheduler {
    pub fn new(
        state: Arc<CoordinatorState>,
        metrics_collector: Arc<dyn CoordinatorMetricsCollector>,
    ) -> Self {
        Self {
            state,
            metrics_collector,
        }
    }
}

#[async_trait]
impl EventAction<CoordinatorServerEvent> for StageScheduler {
    fn on_start(&self) {
        info!("Starting the coordinator event processing");
    }

    fn on_stop(&self) {
        debug!("Coordinator event processing stopped");
    }

    async fn on_receive(&self, event: CoordinatorServerEvent) -> Result<()> {
        match event {
            CoordinatorServerEvent::StageEnd { shuffle_id } => {
                let start = Instant::now();
                let shuffle = self.state.shuffle_manager.get_or_create(shuffle_id);
                self.state
                    .stage_manager
                    .handle_stage_end(&self.state.app_id, &shuffle)
                    .await;
                self.metrics_collector.record_stage_end(
                    shuffle_id,
                    start.elapsed().as_millis() as u64,
                    shuffle.stage_end_state() == StageEndState::DataLost,
                );
            }
        }
        Ok(())
    }

    fn on_error(&self, error: RiffleError) {
        error!("Coordinator event processing failed: {}", error);
    }
}
