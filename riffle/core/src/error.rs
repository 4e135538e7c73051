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

//! Riffle error types

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

pub type Result<T> = result::Result<T, RiffleError>;

/// Riffle error
#[derive(Debug)]
pub enum RiffleError {
    Internal(String),
    Configuration(String),
    /// Not enough non-blacklisted workers to place a primary (and, when
    /// replication is on, a replica on a distinct worker).
    InsufficientCandidates {
        required: usize,
        available: usize,
    },
    MasterUnreachable(String),
    WorkerUnreachable {
        worker: String,
        message: String,
    },
    ReserveSlotsFailed(String),
    ShuffleNotRegistered(u32),
    StageEndTimeout(u32),
    IoError(io::Error),
}

impl RiffleError {
    pub fn internal(message: impl Into<String>) -> Self {
        RiffleError::Internal(message.into())
    }
}

impl From<io::Error> for RiffleError {
    fn from(e: io::Error) -> Self {
        RiffleError::IoError(e)
    }
}

impl From<String> for RiffleError {
    fn from(e: String) -> Self {
        RiffleError::Internal(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RiffleError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RiffleError::Internal(format!("Channel send failed: {}", e))
    }
}

impl From<tokio::task::JoinError> for RiffleError {
    fn from(e: tokio::task::JoinError) -> Self {
        RiffleError::Internal(format!("Task join failed: {}", e))
    }
}

impl Display for RiffleError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            RiffleError::Internal(message) => {
                write!(f, "Internal error: {}", message)
            }
            RiffleError::Configuration(message) => {
                write!(f, "Configuration error: {}", message)
            }
            RiffleError::InsufficientCandidates {
                required,
                available,
            } => write!(
                f,
                "Insufficient candidate workers: required {} but only {} available",
                required, available
            ),
            RiffleError::MasterUnreachable(message) => {
                write!(f, "Master unreachable: {}", message)
            }
            RiffleError::WorkerUnreachable { worker, message } => {
                write!(f, "Worker {} unreachable: {}", worker, message)
            }
            RiffleError::ReserveSlotsFailed(message) => {
                write!(f, "Failed to reserve slots: {}", message)
            }
            RiffleError::ShuffleNotRegistered(shuffle_id) => {
                write!(f, "Shuffle {} is not registered", shuffle_id)
            }
            RiffleError::StageEndTimeout(shuffle_id) => {
                write!(f, "Timed out waiting for stage end of shuffle {}", shuffle_id)
            }
            RiffleError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for RiffleError {}
