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

//! Pluggable observability hooks for the coordinator

use std::sync::Arc;

/// Receives coordinator lifecycle events. Implementations must be cheap and
/// non-blocking; they run on the dispatch path.
pub trait CoordinatorMetricsCollector: Send + Sync {
    fn record_shuffle_registered(&self, shuffle_id: u32);

    fn record_stage_end(&self, shuffle_id: u32, duration_ms: u64, data_lost: bool);

    fn record_shuffle_removed(&self, shuffle_id: u32);
}

/// Collector that ignores every event
#[derive(Default)]
pub struct NoopMetricsCollector {}

impl CoordinatorMetricsCollector for NoopMetricsCollector {
    fn record_shuffle_registered(&self, _shuffle_id: u32) {}

    fn record_stage_end(&self, _shuffle_id: u32, _duration_ms: u64, _data_lost: bool) {}

    fn record_shuffle_removed(&self, _shuffle_id: u32) {}
}

pub fn default_metrics_collector() -> Arc<dyn CoordinatorMetricsCollector> {
    Arc::new(NoopMetricsCollector::default())
}
