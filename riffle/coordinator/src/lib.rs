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

//! The shuffle lifecycle coordinator: the per-application control plane that
//! places shuffle partitions on storage workers, replaces failed partitions
//! mid-stage, drives the stage-end commit barrier and releases resources
//! when a shuffle is unregistered.

pub mod coordinator_server;
pub mod metrics;
pub mod state;

#[cfg(test)]
pub mod test_utils;
