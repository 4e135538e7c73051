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

//! A generic event loop: single-writer dispatch of typed events to an
//! [`EventAction`], decoupling request handlers from the work they enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::error::{Result, RiffleError};

/// Handles events dispatched by an [`EventLoop`]
#[async_trait]
pub trait EventAction<E>: Send + Sync {
    fn on_start(&self);

    fn on_stop(&self);

    async fn on_receive(&self, event: E) -> Result<()>;

    fn on_error(&self, error: RiffleError);
}

/// Sending half of an event loop channel
#[derive(Clone)]
pub struct EventSender<E> {
    tx_event: mpsc::Sender<E>,
}

impl<E: Send + 'static> EventSender<E> {
    pub fn new(tx_event: mpsc::Sender<E>) -> Self {
        Self { tx_event }
    }

    pub async fn post_event(&self, event: E) -> Result<()> {
        Ok(self.tx_event.send(event).await?)
    }
}

#[derive(Clone)]
pub struct EventLoop<E> {
    pub name: String,
    pub buffer_size: usize,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    tx_event: Option<mpsc::Sender<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(name: String, buffer_size: usize, action: Arc<dyn EventAction<E>>) -> Self {
        Self {
            name,
            buffer_size,
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            tx_event: None,
        }
    }

    fn run(&self, mut rx_event: mpsc::Receiver<E>) {
        if self.tx_event.is_none() {
            error!("Event loop {} has not been started", self.name);
            return;
        }

        let name = self.name.clone();
        let stopped = self.stopped.clone();
        let action = self.action.clone();
        tokio::spawn(async move {
            info!("Starting the event loop {}", name);
            while !stopped.load(Ordering::SeqCst) {
                if let Some(event) = rx_event.recv().await {
                    if let Err(e) = action.on_receive(event).await {
                        error!("Fail to process event in the event loop {}: {}", name, e);
                        action.on_error(e);
                    }
                } else {
                    info!("Event channel of the event loop {} is closed", name);
                    break;
                }
            }
            debug!("The event loop {} has been stopped", name);
        });
    }

    pub fn start(&mut self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RiffleError::internal(format!(
                "Event loop {} already stopped",
                self.name
            )));
        }
        if self.tx_event.is_some() {
            return Err(RiffleError::internal(format!(
                "Event loop {} already started",
                self.name
            )));
        }

        let (tx_event, rx_event) = mpsc::channel::<E>(self.buffer_size);
        self.tx_event = Some(tx_event);
        self.action.on_start();
        self.run(rx_event);

        Ok(())
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.action.on_stop();
        }
    }

    pub fn get_sender(&self) -> Result<EventSender<E>> {
        Ok(EventSender::new(self.tx_event.clone().ok_or_else(
            || RiffleError::internal(format!("Event loop {} not started", self.name)),
        )?))
    }
}
