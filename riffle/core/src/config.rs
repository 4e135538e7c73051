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

//! Riffle configuration

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{Result, RiffleError};
use crate::meta::{PartitionType, SplitMode};

pub const RIFFLE_REPLICATE: &str = "riffle.shuffle.replicate";
pub const RIFFLE_PARTITION_TYPE: &str = "riffle.shuffle.partition.type";
pub const RIFFLE_PARTITION_SPLIT_THRESHOLD: &str = "riffle.shuffle.partition.split.threshold";
pub const RIFFLE_PARTITION_SPLIT_MODE: &str = "riffle.shuffle.partition.split.mode";
pub const RIFFLE_RANGE_READ_FILTER: &str = "riffle.shuffle.range.read.filter.enabled";
pub const RIFFLE_STAGE_END_TIMEOUT_MS: &str = "riffle.stage.end.timeout.ms";
pub const RIFFLE_REMOVE_SHUFFLE_DELAY_MS: &str = "riffle.shuffle.remove.delay.ms";
pub const RIFFLE_GET_BLACKLIST_DELAY_MS: &str = "riffle.blacklist.refresh.interval.ms";
pub const RIFFLE_APPLICATION_HEARTBEAT_INTERVAL_MS: &str =
    "riffle.application.heartbeat.interval.ms";
pub const RIFFLE_RESERVE_SLOTS_MAX_RETRY: &str = "riffle.reserve.slots.max.retry";
pub const RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS: &str = "riffle.reserve.slots.retry.wait.ms";
pub const RIFFLE_RPC_MAX_PARALLELISM: &str = "riffle.rpc.max.parallelism";
pub const RIFFLE_COORDINATOR_PORT: &str = "riffle.coordinator.port";
pub const RIFFLE_EVENT_LOOP_BUFFER_SIZE: &str = "riffle.coordinator.event.loop.buffer.size";

/// Value type a configuration entry is validated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigType {
    Bool,
    UInt16,
    UInt32,
    UInt64,
    Utf8,
}

/// Configuration option meta-data
#[derive(Debug, Clone)]
struct ConfigEntry {
    name: &'static str,
    _description: &'static str,
    data_type: ConfigType,
    default_value: &'static str,
}

impl ConfigEntry {
    const fn new(
        name: &'static str,
        description: &'static str,
        data_type: ConfigType,
        default_value: &'static str,
    ) -> Self {
        Self {
            name,
            _description: description,
            data_type,
            default_value,
        }
    }
}

static VALID_ENTRIES: Lazy<HashMap<&'static str, ConfigEntry>> = Lazy::new(|| {
    let entries = vec![
        ConfigEntry::new(
            RIFFLE_REPLICATE,
            "Mirror every primary partition to a replica on a different worker",
            ConfigType::Bool,
            "false",
        ),
        ConfigEntry::new(
            RIFFLE_PARTITION_TYPE,
            "Partition type of the shuffle ('reduce' or 'map'); sets the id space for slot requests",
            ConfigType::Utf8,
            "reduce",
        ),
        ConfigEntry::new(
            RIFFLE_PARTITION_SPLIT_THRESHOLD,
            "Size in bytes above which workers are asked to split a partition",
            ConfigType::UInt64,
            "1073741824",
        ),
        ConfigEntry::new(
            RIFFLE_PARTITION_SPLIT_MODE,
            "Split behavior forwarded to workers ('soft' or 'hard')",
            ConfigType::Utf8,
            "soft",
        ),
        ConfigEntry::new(
            RIFFLE_RANGE_READ_FILTER,
            "Ask workers to maintain a range read filter for reserved slots",
            ConfigType::Bool,
            "false",
        ),
        ConfigEntry::new(
            RIFFLE_STAGE_END_TIMEOUT_MS,
            "Maximum time to wait for stage end in GetReducerFileGroup and Unregister",
            ConfigType::UInt64,
            "120000",
        ),
        ConfigEntry::new(
            RIFFLE_REMOVE_SHUFFLE_DELAY_MS,
            "Delay after unregister before per-shuffle state is dropped",
            ConfigType::UInt64,
            "60000",
        ),
        ConfigEntry::new(
            RIFFLE_GET_BLACKLIST_DELAY_MS,
            "Interval between blacklist refreshes from the master",
            ConfigType::UInt64,
            "30000",
        ),
        ConfigEntry::new(
            RIFFLE_APPLICATION_HEARTBEAT_INTERVAL_MS,
            "Interval between application heartbeats to the master",
            ConfigType::UInt64,
            "10000",
        ),
        ConfigEntry::new(
            RIFFLE_RESERVE_SLOTS_MAX_RETRY,
            "Number of reserve-slots attempts before the registration fails",
            ConfigType::UInt32,
            "3",
        ),
        ConfigEntry::new(
            RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS,
            "Wait between reserve-slots attempts",
            ConfigType::UInt64,
            "3000",
        ),
        ConfigEntry::new(
            RIFFLE_RPC_MAX_PARALLELISM,
            "Upper bound on concurrent outbound worker RPCs per fan-out",
            ConfigType::UInt32,
            "1024",
        ),
        ConfigEntry::new(
            RIFFLE_COORDINATOR_PORT,
            "Bind port for the coordinator endpoint",
            ConfigType::UInt16,
            "9097",
        ),
        ConfigEntry::new(
            RIFFLE_EVENT_LOOP_BUFFER_SIZE,
            "Buffer size of the coordinator event loop channel",
            ConfigType::UInt32,
            "10000",
        ),
    ];
    entries.into_iter().map(|e| (e.name, e)).collect()
});

/// Riffle configuration, a set of validated key-value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiffleConfig {
    settings: HashMap<String, String>,
}

/// Riffle configuration builder
#[derive(Default)]
pub struct RiffleConfigBuilder {
    settings: HashMap<String, String>,
}

impl RiffleConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new config with an additional setting
    pub fn set(mut self, k: &str, v: &str) -> Self {
        self.settings.insert(k.to_owned(), v.to_owned());
        self
    }

    pub fn build(self) -> Result<RiffleConfig> {
        for (name, value) in &self.settings {
            let entry = VALID_ENTRIES.get(name.as_str()).ok_or_else(|| {
                RiffleError::Configuration(format!("Unknown configuration key '{}'", name))
            })?;
            validate(entry, value)?;
        }
        Ok(RiffleConfig {
            settings: self.settings,
        })
    }
}

fn validate(entry: &ConfigEntry, value: &str) -> Result<()> {
    let ok = match entry.data_type {
        ConfigType::Bool => value.parse::<bool>().is_ok(),
        ConfigType::UInt16 => value.parse::<u16>().is_ok(),
        ConfigType::UInt32 => value.parse::<u32>().is_ok(),
        ConfigType::UInt64 => value.parse::<u64>().is_ok(),
        ConfigType::Utf8 => true,
    };
    if ok {
        Ok(())
    } else {
        Err(RiffleError::Configuration(format!(
            "Invalid value '{}' for configuration key '{}' ({:?} expected)",
            value, entry.name, entry.data_type
        )))
    }
}

impl Default for RiffleConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RiffleConfig {
    /// Create a configuration holding only default values
    pub fn new() -> Self {
        Self {
            settings: HashMap::new(),
        }
    }

    /// Create a new config builder
    pub fn builder() -> RiffleConfigBuilder {
        RiffleConfigBuilder::new()
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn replicate(&self) -> bool {
        self.get_bool_setting(RIFFLE_REPLICATE)
    }

    pub fn partition_type(&self) -> PartitionType {
        match self.get_string_setting(RIFFLE_PARTITION_TYPE).as_str() {
            "map" => PartitionType::Map,
            _ => PartitionType::Reduce,
        }
    }

    pub fn partition_split_threshold(&self) -> u64 {
        self.get_u64_setting(RIFFLE_PARTITION_SPLIT_THRESHOLD)
    }

    pub fn partition_split_mode(&self) -> SplitMode {
        match self.get_string_setting(RIFFLE_PARTITION_SPLIT_MODE).as_str() {
            "hard" => SplitMode::Hard,
            _ => SplitMode::Soft,
        }
    }

    pub fn range_read_filter(&self) -> bool {
        self.get_bool_setting(RIFFLE_RANGE_READ_FILTER)
    }

    pub fn stage_end_timeout_ms(&self) -> u64 {
        self.get_u64_setting(RIFFLE_STAGE_END_TIMEOUT_MS)
    }

    pub fn remove_shuffle_delay_ms(&self) -> u64 {
        self.get_u64_setting(RIFFLE_REMOVE_SHUFFLE_DELAY_MS)
    }

    pub fn get_blacklist_delay_ms(&self) -> u64 {
        self.get_u64_setting(RIFFLE_GET_BLACKLIST_DELAY_MS)
    }

    pub fn application_heartbeat_interval_ms(&self) -> u64 {
        self.get_u64_setting(RIFFLE_APPLICATION_HEARTBEAT_INTERVAL_MS)
    }

    pub fn reserve_slots_max_retry(&self) -> u32 {
        self.get_u32_setting(RIFFLE_RESERVE_SLOTS_MAX_RETRY)
    }

    pub fn reserve_slots_retry_wait_ms(&self) -> u64 {
        self.get_u64_setting(RIFFLE_RESERVE_SLOTS_RETRY_WAIT_MS)
    }

    pub fn rpc_max_parallelism(&self) -> u32 {
        self.get_u32_setting(RIFFLE_RPC_MAX_PARALLELISM)
    }

    pub fn coordinator_port(&self) -> u16 {
        self.get_u16_setting(RIFFLE_COORDINATOR_PORT)
    }

    pub fn event_loop_buffer_size(&self) -> u32 {
        self.get_u32_setting(RIFFLE_EVENT_LOOP_BUFFER_SIZE)
    }

    fn get_string_setting(&self, key: &str) -> String {
        if let Some(v) = self.settings.get(key) {
            return v.clone();
        }
        // config entries always have a default value
        VALID_ENTRIES
            .get(key)
            .map(|e| e.default_value.to_owned())
            .unwrap_or_default()
    }

    fn get_bool_setting(&self, key: &str) -> bool {
        self.get_string_setting(key).parse::<bool>().unwrap_or(false)
    }

    fn get_u16_setting(&self, key: &str) -> u16 {
        self.get_string_setting(key).parse::<u16>().unwrap_or(0)
    }

    fn get_u32_setting(&self, key: &str) -> u32 {
        self.get_string_setting(key).parse::<u32>().unwrap_or(0)
    }

    fn get_u64_setting(&self, key: &str) -> u64 {
        self.get_string_setting(key).parse::<u64>().unwrap_or(0)
    }
}
