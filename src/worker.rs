//! The dedicated thread that owns the device while streaming.

use crate::controller::{StreamController, StreamState};
use crate::decoder::StreamStats;
use crate::error::{ErrorKind, Result, StreamError};
use crate::handoff::SampleHandoff;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Limits on what the worker recovers from by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Reinitializations allowed after the controller entered `Failed`.
    pub max_restarts: u32,
    /// Transport failures in a row before giving up.
    pub max_consecutive_transport_errors: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            max_consecutive_transport_errors: 50,
        }
    }
}

/// How the worker thread ended.
#[derive(Debug)]
pub struct WorkerReport {
    pub stats: StreamStats,
    pub restarts: u32,
    pub final_state: StreamState,
    /// `None` when the worker stopped because it was asked to.
    pub error: Option<StreamError>,
}

pub struct StreamWorker {
    stop: Arc<AtomicBool>,
    handoff: SampleHandoff,
    handle: JoinHandle<WorkerReport>,
}

impl StreamWorker {
    /// Moves the controller onto a new thread that initializes, starts and
    /// reads until [`StreamWorker::request_stop`].
    pub fn spawn<T>(controller: StreamController<T>, policy: RestartPolicy) -> Result<Self>
    where
        T: Transport + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let handoff = controller.handoff();
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("u3-stream".to_string())
                .spawn(move || run(controller, &stop, policy))
                .map_err(StreamError::Spawn)?
        };
        Ok(Self { stop, handoff, handle })
    }

    pub fn handoff(&self) -> SampleHandoff {
        self.handoff.clone()
    }

    /// The flag the thread polls between reads.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Requests a stop and waits for the thread to wind down.
    pub fn join(self) -> WorkerReport {
        self.request_stop();
        match self.handle.join() {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn report<T: Transport>(
    controller: StreamController<T>,
    restarts: u32,
    error: Option<StreamError>,
) -> WorkerReport {
    let report = WorkerReport {
        stats: controller.stats(),
        restarts,
        final_state: controller.state(),
        error,
    };
    controller.shutdown();
    report
}

fn run<T: Transport>(mut controller: StreamController<T>, stop: &AtomicBool, policy: RestartPolicy) -> WorkerReport {
    if let Err(e) = controller.initialize().and_then(|()| controller.start()) {
        error!("Could not start stream: {}", e);
        return report(controller, 0, Some(e));
    }

    let mut restarts = 0;
    let mut transport_errors = 0;
    while !stop.load(Ordering::Relaxed) {
        let err = match controller.read() {
            Ok(_) => {
                transport_errors = 0;
                continue;
            }
            Err(e) => e,
        };

        match err.kind() {
            ErrorKind::Framing => {}
            ErrorKind::Transport => {
                transport_errors += 1;
                if transport_errors >= policy.max_consecutive_transport_errors {
                    error!(transport_errors, "Giving up after repeated transport failures: {}", err);
                    controller.stop();
                    return report(controller, restarts, Some(err));
                }
            }
            ErrorKind::Protocol | ErrorKind::Desync | ErrorKind::Usage => {
                if restarts >= policy.max_restarts {
                    error!(restarts, "Restart limit reached: {}", err);
                    return report(controller, restarts, Some(err));
                }
                restarts += 1;
                transport_errors = 0;
                warn!(restarts, "Restarting stream after: {}", err);
                if let Err(e) = controller.reinitialize() {
                    error!("Reinitialize failed: {}", e);
                    return report(controller, restarts, Some(e));
                }
            }
        }
    }

    controller.stop();
    info!("Stream worker stopped");
    report(controller, restarts, None)
}
