//! Submission thread shared by the backends.
//!
//! Each transport owns one worker. Jobs run strictly in submission order and
//! each job's completion is invoked from the worker thread once the transfer
//! finishes.

use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use edgetpu_chip::usb::SetupPacket;
use tracing::trace;

use crate::error::{EdgeTpuError, Result};
use crate::transport::Completion;

/// One queued submission.
pub(crate) enum Job {
    Control {
        setup: SetupPacket,
        data: Bytes,
        done: Completion<Bytes>,
    },
    BulkOut {
        endpoint: u8,
        data: Bytes,
        done: Completion<usize>,
    },
    BulkIn {
        endpoint: u8,
        length: usize,
        done: Completion<Bytes>,
    },
}

impl Job {
    /// Complete the job with `error` without running it.
    pub(crate) fn fail(self, error: EdgeTpuError) {
        match self {
            Self::Control { done, .. } | Self::BulkIn { done, .. } => done(Err(error)),
            Self::BulkOut { done, .. } => done(Err(error)),
        }
    }
}

pub(crate) struct Worker {
    name: &'static str,
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a thread feeding every submitted job to `handler`.
    pub(crate) fn spawn<F>(name: &'static str, mut handler: F) -> Result<Self>
    where
        F: FnMut(Job) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    handler(job);
                }
                trace!("{} worker exiting", name);
            })
            .map_err(|e| EdgeTpuError::resource(format!("cannot start {name} worker: {e}")))?;
        Ok(Self {
            name,
            jobs: Some(tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let Some(jobs) = &self.jobs else {
            return Err(EdgeTpuError::transfer_failed(format!("{} stopped", self.name)));
        };
        jobs.send(job)
            .map_err(|_| EdgeTpuError::transfer_failed(format!("{} worker gone", self.name)))
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.jobs.is_some())
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
