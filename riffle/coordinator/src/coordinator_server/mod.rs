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

//! The coordinator endpoint: routes task requests to the state handlers,
//! runs the event loop behind stage end and owns the periodic loops
//! (expiration sweep, blacklist refresh, application heartbeat).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio::sync::watch;

use riffle_core::config::RiffleConfig;
use riffle_core::error::Result;
use riffle_core::event_loop::EventLoop;
use riffle_core::messages::{
    ChangeLocationResponse, ControlMessage, ControlResponse, GetReducerFileGroupResponse,
    HeartbeatFromApplication, MapperEndResponse, RegisterShuffleResponse, ReviveCause, StatusCode,
};
use riffle_core::meta::{PartitionLocation, UserIdentifier};
use riffle_core::rpc::{MasterClient, WorkerClientFactory};

use crate::coordinator_server::event::CoordinatorServerEvent;
use crate::coordinator_server::stage_scheduler::StageScheduler;
use crate::metrics::CoordinatorMetricsCollector;
use crate::state::{ChangeContext, CoordinatorState};

pub mod event;
mod stage_scheduler;

pub struct CoordinatorServer {
    pub app_id: String,
    pub start_time: u128,
    pub(crate) state: Arc<CoordinatorState>,
    pub(crate) stage_event_loop: EventLoop<CoordinatorServerEvent>,
    metrics_collector: Arc<dyn CoordinatorMetricsCollector>,
    shutdown: watch::Sender<bool>,
}

impl CoordinatorServer {
    pub fn new(
        app_id: String,
        coordinator_host: String,
        conf: RiffleConfig,
        user_identifier: UserIdentifier,
        master: Arc<dyn MasterClient>,
        worker_factory: Arc<dyn WorkerClientFactory>,
        metrics_collector: Arc<dyn CoordinatorMetricsCollector>,
    ) -> Self {
        let state = Arc::new(CoordinatorState::new(
            app_id.clone(),
            coordinator_host,
            conf.clone(),
            user_identifier,
            master,
            worker_factory,
        ));
        let stage_scheduler = Arc::new(StageScheduler::new(
            state.clone(),
            metrics_collector.clone(),
        ));
        let stage_event_loop = EventLoop::new(
            "stage-end".to_owned(),
            conf.event_loop_buffer_size() as usize,
            stage_scheduler,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            app_id,
            start_time: timestamp_millis() as u128,
            state,
            stage_event_loop,
            metrics_collector,
            shutdown,
        }
    }

    pub async fn init(&mut self) -> Result<()> {
        self.stage_event_loop.start()?;
        self.start_expiration_sweeper();
        self.start_blacklist_refresh();
        self.start_application_heartbeat();

        Ok(())
    }

    /// Stop the event loop and every periodic task. In-flight fan-outs
    /// finish on their own.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.stage_event_loop.stop();
    }

    // -- inbound API ---------------------------------------------------------

    pub async fn register_shuffle(
        &self,
        shuffle_id: u32,
        num_mappers: u32,
        num_reducers: u32,
    ) -> RegisterShuffleResponse {
        let response = self
            .state
            .register_shuffle(shuffle_id, num_mappers, num_reducers)
            .await;
        if response.status.is_success() {
            self.metrics_collector.record_shuffle_registered(shuffle_id);
        }
        response
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn revive(
        &self,
        shuffle_id: u32,
        map_id: u32,
        attempt_id: i32,
        partition_id: u32,
        epoch: u32,
        old_location: Option<PartitionLocation>,
        cause: ReviveCause,
    ) -> ChangeLocationResponse {
        self.state
            .handle_partition_change(
                shuffle_id,
                partition_id,
                epoch,
                old_location,
                ChangeContext::Revive {
                    map_id,
                    attempt_id,
                    cause,
                },
            )
            .await
    }

    pub async fn partition_split(
        &self,
        shuffle_id: u32,
        partition_id: u32,
        epoch: u32,
        old_location: PartitionLocation,
    ) -> ChangeLocationResponse {
        self.state
            .handle_partition_change(
                shuffle_id,
                partition_id,
                epoch,
                Some(old_location),
                ChangeContext::Split,
            )
            .await
    }

    pub async fn mapper_end(
        &self,
        shuffle_id: u32,
        map_id: u32,
        attempt_id: i32,
        num_mappers: u32,
    ) -> MapperEndResponse {
        let (status, stage_end_due) = self
            .state
            .mapper_end(shuffle_id, map_id, attempt_id, num_mappers);
        if stage_end_due {
            if let Err(e) = self.stage_end(shuffle_id).await {
                warn!(
                    "Could not enqueue stage end of shuffle {}: {}",
                    shuffle_id, e
                );
            }
        }
        MapperEndResponse { status }
    }

    pub async fn get_reducer_file_group(&self, shuffle_id: u32) -> GetReducerFileGroupResponse {
        self.state.get_reducer_file_group(shuffle_id).await
    }

    /// Fire-and-forget: enqueue the commit barrier of a shuffle
    pub async fn stage_end(&self, shuffle_id: u32) -> Result<()> {
        self.stage_event_loop
            .get_sender()?
            .post_event(CoordinatorServerEvent::StageEnd { shuffle_id })
            .await
    }

    /// Unregister a shuffle: make sure the barrier ran (bounded wait), then
    /// clear leftovers and queue the shuffle for expiration.
    pub async fn unregister_shuffle(&self, shuffle_id: u32) -> Result<()> {
        if let Some(shuffle) = self.state.shuffle_manager.get(shuffle_id) {
            if !shuffle.stage_end_state().is_finished() {
                self.stage_end(shuffle_id).await?;
                let timeout = Duration::from_millis(self.state.conf.stage_end_timeout_ms());
                if shuffle.wait_stage_end(timeout).await.is_none() {
                    warn!(
                        "Stage end of shuffle {} did not finish within {:?}, unregistering anyway",
                        shuffle_id, timeout
                    );
                }
            }
        }
        self.state.finish_unregister(shuffle_id).await;
        Ok(())
    }

    /// Route one inbound message to its handler
    pub async fn handle_control_message(&self, message: ControlMessage) -> ControlResponse {
        if !self.accepts(&message) {
            return ControlResponse::Ack(StatusCode::Failed);
        }
        match message {
            ControlMessage::RegisterShuffle {
                shuffle_id,
                num_mappers,
                num_reducers,
                ..
            } => ControlResponse::RegisterShuffle(
                self.register_shuffle(shuffle_id, num_mappers, num_reducers)
                    .await,
            ),
            ControlMessage::Revive {
                shuffle_id,
                map_id,
                attempt_id,
                partition_id,
                epoch,
                old_location,
                cause,
                ..
            } => ControlResponse::ChangeLocation(
                self.revive(
                    shuffle_id,
                    map_id,
                    attempt_id,
                    partition_id,
                    epoch,
                    old_location,
                    cause,
                )
                .await,
            ),
            ControlMessage::PartitionSplit {
                shuffle_id,
                partition_id,
                epoch,
                old_location,
                ..
            } => ControlResponse::ChangeLocation(
                self.partition_split(shuffle_id, partition_id, epoch, old_location)
                    .await,
            ),
            ControlMessage::MapperEnd {
                shuffle_id,
                map_id,
                attempt_id,
                num_mappers,
                ..
            } => ControlResponse::MapperEnd(
                self.mapper_end(shuffle_id, map_id, attempt_id, num_mappers)
                    .await,
            ),
            ControlMessage::GetReducerFileGroup { shuffle_id, .. } => {
                ControlResponse::GetReducerFileGroup(
                    self.get_reducer_file_group(shuffle_id).await,
                )
            }
            ControlMessage::StageEnd { shuffle_id, .. } => {
                let status = match self.stage_end(shuffle_id).await {
                    Ok(()) => StatusCode::Success,
                    Err(_) => StatusCode::Failed,
                };
                ControlResponse::Ack(status)
            }
            ControlMessage::UnregisterShuffle { shuffle_id, .. } => {
                let status = match self.unregister_shuffle(shuffle_id).await {
                    Ok(()) => StatusCode::Success,
                    Err(_) => StatusCode::Failed,
                };
                ControlResponse::Ack(status)
            }
        }
    }

    fn accepts(&self, message: &ControlMessage) -> bool {
        let app_id = match message {
            ControlMessage::RegisterShuffle { app_id, .. }
            | ControlMessage::Revive { app_id, .. }
            | ControlMessage::PartitionSplit { app_id, .. }
            | ControlMessage::MapperEnd { app_id, .. }
            | ControlMessage::GetReducerFileGroup { app_id, .. }
            | ControlMessage::StageEnd { app_id, .. }
            | ControlMessage::UnregisterShuffle { app_id, .. } => app_id,
        };
        if app_id == &self.app_id {
            true
        } else {
            warn!(
                "Dropping message of application {} (this coordinator serves {})",
                app_id, self.app_id
            );
            false
        }
    }

    // -- periodic tasks ------------------------------------------------------

    /// Periodically drop per-shuffle state whose unregister happened more
    /// than `remove_shuffle_delay` ago. Runs beside the event loop so a
    /// stuck commit fan-out cannot starve cleanup.
    fn start_expiration_sweeper(&self) {
        let state = self.state.clone();
        let metrics_collector = self.metrics_collector.clone();
        let interval = Duration::from_millis(state.conf.remove_shuffle_delay_ms().max(1));
        let mut shutdown = self.shutdown.subscribe();
        tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        for shuffle_id in state.remove_expired_shuffles().await {
                            metrics_collector.record_shuffle_removed(shuffle_id);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Expiration sweeper stopped");
        });
    }

    /// Periodically replace the local blacklist with the master's view
    fn start_blacklist_refresh(&self) {
        let state = self.state.clone();
        let interval = Duration::from_millis(state.conf.get_blacklist_delay_ms().max(1));
        let mut shutdown = self.shutdown.subscribe();
        tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = state
                            .worker_manager
                            .refresh_blacklist(state.master.as_ref())
                            .await
                        {
                            warn!("Blacklist refresh failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Blacklist refresh stopped");
        });
    }

    /// Periodically report liveness and usage to the master
    fn start_application_heartbeat(&self) {
        let state = self.state.clone();
        let interval =
            Duration::from_millis(state.conf.application_heartbeat_interval_ms().max(1));
        let mut shutdown = self.shutdown.subscribe();
        tokio::task::spawn(async move {
            let mut epoch: u64 = 0;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let heartbeat = HeartbeatFromApplication {
                            app_id: state.app_id.clone(),
                            total_written: state.stage_manager.total_written(),
                            file_count: state.stage_manager.file_count(),
                            epoch,
                        };
                        epoch += 1;
                        if let Err(e) = state.master.heartbeat_from_application(heartbeat).await {
                            warn!("Application heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Application heartbeat stopped");
        });
    }
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

#[cfg(test)]
mod test {
    use super::*;

    use riffle_core::config::{
        RIFFLE_APPLICATION_HEARTBEAT_INTERVAL_MS, RIFFLE_GET_BLACKLIST_DELAY_MS,
        RIFFLE_REMOVE_SHUFFLE_DELAY_MS, RIFFLE_REPLICATE, RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS,
        RIFFLE_STAGE_END_TIMEOUT_MS,
    };
    use riffle_core::meta::PartitionMode;

    use crate::state::shuffle_manager::StageEndState;
    use crate::test_utils::{test_server, TestCluster};

    fn test_conf() -> RiffleConfig {
        RiffleConfig::builder()
            .set(RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS, "1")
            .set(RIFFLE_STAGE_END_TIMEOUT_MS, "2000")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_without_replication() -> Result<()> {
        let cluster = TestCluster::new(3);
        let mut server = test_server(&cluster, test_conf());
        server.init().await?;

        let response = server.register_shuffle(1, 4, 8).await;
        assert_eq!(StatusCode::Success, response.status);
        assert_eq!(8, response.partition_locations.len());

        for map_id in 0..4 {
            let response = server.mapper_end(1, map_id, 0, 4).await;
            assert_eq!(StatusCode::Success, response.status);
        }

        let groups = server.get_reducer_file_group(1).await;
        assert_eq!(StatusCode::Success, groups.status);
        assert_eq!(8, groups.file_groups.len());
        assert!(groups.file_groups.iter().all(|g| !g.is_empty()));
        assert_eq!(vec![0, 0, 0, 0], groups.mapper_attempts);

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn reducers_block_until_the_last_mapper_ends() -> Result<()> {
        let cluster = TestCluster::new(3);
        let mut server = test_server(&cluster, test_conf());
        server.init().await?;
        let server = Arc::new(server);

        server.register_shuffle(1, 2, 4).await;
        server.mapper_end(1, 0, 0, 2).await;

        let waiting = {
            let server = server.clone();
            tokio::spawn(async move { server.get_reducer_file_group(1).await })
        };

        server.mapper_end(1, 1, 0, 2).await;
        let groups = waiting.await.unwrap();
        assert_eq!(StatusCode::Success, groups.status);
        assert_eq!(4, groups.file_groups.len());

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn data_loss_is_reported_to_reducers() -> Result<()> {
        let cluster = TestCluster::new(3);
        let conf = RiffleConfig::builder()
            .set(RIFFLE_REPLICATE, "true")
            .set(RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS, "1")
            .set(RIFFLE_STAGE_END_TIMEOUT_MS, "2000")
            .build()
            .unwrap();
        let mut server = test_server(&cluster, conf);
        server.init().await?;

        let response = server.register_shuffle(1, 1, 4).await;
        assert_eq!(StatusCode::Success, response.status);

        // partition 2 loses both its locations
        let target = &response.partition_locations[2];
        cluster.fail_commit_location(&target.worker, &target.unique_id(), PartitionMode::Primary);
        let replica_worker = target.peer().unwrap().worker.clone();
        cluster.fail_commit_location(&replica_worker, &target.unique_id(), PartitionMode::Replica);

        server.mapper_end(1, 0, 0, 1).await;

        let groups = server.get_reducer_file_group(1).await;
        assert_eq!(StatusCode::ShuffleDataLost, groups.status);

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn explicit_stage_end_message_is_idempotent() -> Result<()> {
        let cluster = TestCluster::new(2);
        let mut server = test_server(&cluster, test_conf());
        server.init().await?;

        server.register_shuffle(1, 1, 2).await;
        server.mapper_end(1, 0, 0, 1).await;

        let groups = server.get_reducer_file_group(1).await;
        assert_eq!(StatusCode::Success, groups.status);
        let commits = cluster.commit_calls();

        // replays are swallowed by the single-flight barrier
        server.stage_end(1).await?;
        server.stage_end(1).await?;
        let groups = server.get_reducer_file_group(1).await;
        assert_eq!(StatusCode::Success, groups.status);
        assert_eq!(commits, cluster.commit_calls());

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn unregister_proceeds_after_stage_end_timeout() -> Result<()> {
        let cluster = TestCluster::new(2);
        let conf = RiffleConfig::builder()
            .set(RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS, "1")
            .set(RIFFLE_STAGE_END_TIMEOUT_MS, "200")
            .set(RIFFLE_REMOVE_SHUFFLE_DELAY_MS, "50")
            .set(RIFFLE_GET_BLACKLIST_DELAY_MS, "3600000")
            .set(RIFFLE_APPLICATION_HEARTBEAT_INTERVAL_MS, "3600000")
            .build()
            .unwrap();
        let mut server = test_server(&cluster, conf);
        server.init().await?;

        let response = server.register_shuffle(1, 1, 2).await;
        assert_eq!(StatusCode::Success, response.status);
        // commits hang forever, so the barrier can never finish in time
        for worker in &cluster.workers {
            cluster.hang_commit_on(worker);
        }

        server.unregister_shuffle(1).await?;
        assert!(server.state.shuffle_manager.is_unregistered(1));

        // the sweeper eventually forgets the shuffle and tells the master
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while server.state.shuffle_manager.contains(1) {
            assert!(std::time::Instant::now() < deadline, "shuffle never expired");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cluster.unregistered().contains(&(server.app_id.clone(), 1)));

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn control_messages_route_to_handlers() -> Result<()> {
        let cluster = TestCluster::new(2);
        let mut server = test_server(&cluster, test_conf());
        server.init().await?;
        let app_id = server.app_id.clone();

        let response = server
            .handle_control_message(ControlMessage::RegisterShuffle {
                app_id: app_id.clone(),
                shuffle_id: 1,
                num_mappers: 1,
                num_reducers: 2,
            })
            .await;
        assert!(matches!(
            response,
            ControlResponse::RegisterShuffle(RegisterShuffleResponse {
                status: StatusCode::Success,
                ..
            })
        ));

        let response = server
            .handle_control_message(ControlMessage::MapperEnd {
                app_id: app_id.clone(),
                shuffle_id: 1,
                map_id: 0,
                attempt_id: 0,
                num_mappers: 1,
            })
            .await;
        assert!(matches!(
            response,
            ControlResponse::MapperEnd(MapperEndResponse {
                status: StatusCode::Success
            })
        ));

        // a message of some other application is refused
        let response = server
            .handle_control_message(ControlMessage::StageEnd {
                app_id: "someone-else".to_owned(),
                shuffle_id: 1,
            })
            .await;
        assert!(matches!(response, ControlResponse::Ack(StatusCode::Failed)));

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn application_heartbeat_reports_usage() -> Result<()> {
        let cluster = TestCluster::new(2);
        let conf = RiffleConfig::builder()
            .set(RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS, "1")
            .set(RIFFLE_APPLICATION_HEARTBEAT_INTERVAL_MS, "10")
            .set(RIFFLE_GET_BLACKLIST_DELAY_MS, "3600000")
            .set(RIFFLE_REMOVE_SHUFFLE_DELAY_MS, "3600000")
            .build()
            .unwrap();
        let mut server = test_server(&cluster, conf);
        server.init().await?;

        server.register_shuffle(1, 1, 2).await;
        server.mapper_end(1, 0, 0, 1).await;
        let groups = server.get_reducer_file_group(1).await;
        assert_eq!(StatusCode::Success, groups.status);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let heartbeats = cluster.heartbeats();
            if heartbeats.iter().any(|h| h.total_written > 0 && h.file_count > 0) {
                // epochs are strictly increasing across beats
                let epochs: Vec<u64> = heartbeats.iter().map(|h| h.epoch).collect();
                assert!(epochs.windows(2).all(|w| w[0] < w[1]));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no usage heartbeat seen");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.stop();
        Ok(())
    }

    #[tokio::test]
    async fn stage_end_state_progresses() -> Result<()> {
        let cluster = TestCluster::new(2);
        let mut server = test_server(&cluster, test_conf());
        server.init().await?;

        server.register_shuffle(1, 1, 2).await;
        let shuffle = server.state.shuffle_manager.get(1).unwrap();
        assert_eq!(StageEndState::NotStarted, shuffle.stage_end_state());

        server.mapper_end(1, 0, 0, 1).await;
        let state = shuffle
            .wait_stage_end(Duration::from_secs(5))
            .await
            .expect("stage end never finished");
        assert_eq!(StageEndState::Done, state);

        server.stop();
        Ok(())
    }
}
