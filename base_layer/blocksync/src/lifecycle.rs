//  Copyright 2024, The Tari Project
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Start/stop bookkeeping shared by the pool and the reactor. Cancellation itself goes through `tari_shutdown`.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use log::*;
use tokio::task::JoinHandle;

use crate::error::ServiceStateError;

const LOG_TARGET: &str = "c::bs::lifecycle";

/// The lifecycle of a startable service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Running,
    Stopped,
}

/// Lock-guarded [ServiceState].
///
/// A failed start leaves the service in `NotStarted` so that it can be started again. `Stopped` is terminal.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ServiceState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::NotStarted),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Runs `on_start` and moves to `Running` if it succeeds. The lock is held for the duration of `on_start` so
    /// concurrent starts are serialized.
    pub fn start<F, E>(&self, on_start: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
        E: From<ServiceStateError>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ServiceState::NotStarted => {},
            ServiceState::Running => return Err(ServiceStateError::AlreadyStarted.into()),
            ServiceState::Stopped => return Err(ServiceStateError::AlreadyStopped.into()),
        }
        on_start()?;
        *state = ServiceState::Running;
        Ok(())
    }

    /// Moves to `Stopped`. Returns false if the service was already stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ServiceState::Stopped {
            return false;
        }
        *state = ServiceState::Stopped;
        true
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the join handles of spawned tasks so that they can be awaited after cancellation.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn spawn<F>(&self, task: F)
    where F: Future<Output = ()> + Send + 'static {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn num_running(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Waits for every tracked task to exit, including tasks spawned while waiting.
    pub async fn wait(&self) {
        loop {
            let handles = {
                let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
                handles.drain(..).collect::<Vec<_>>()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        error!(target: LOG_TARGET, "Task panicked before shutdown: {}", err);
                    }
                }
            }
        }
    }
}
