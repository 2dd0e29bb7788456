//! In-order command queue feeding a device from a dedicated worker thread.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use rotary_core::{Completion, Result, RopeError, RotaryRequest, Signal};

use crate::device::QueueDevice;

enum Command {
    Rotary { request: RotaryRequest, signal: Signal },
    Barrier(Signal),
}

/// FIFO queue of rotary commands bound to one device.
///
/// Commands run one at a time, in submission order. Dropping the queue
/// finishes every command already submitted before the worker exits.
pub struct CommandQueue {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<RopeError>>>,
}

impl CommandQueue {
    pub fn new(device: Arc<dyn QueueDevice>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let last_error = Arc::new(Mutex::new(None));
        let errors = Arc::clone(&last_error);
        let worker = thread::Builder::new()
            .name(format!("rotary-queue-{}", device.name()))
            .spawn(move || {
                for command in receiver {
                    match command {
                        Command::Rotary { request, signal } => {
                            let result = device.execute(&request);
                            if let Err(e) = &result {
                                warn!(device = device.name(), error = %e, "rotary command faulted");
                                *errors.lock() = Some(e.clone());
                            }
                            signal.complete(result);
                        }
                        Command::Barrier(signal) => signal.complete(Ok(())),
                    }
                }
                debug!("command queue worker exiting");
            })
            .map_err(|e| RopeError::Device(format!("failed to start queue worker: {e}")))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            last_error,
        })
    }

    /// Enqueue `request`; the completion fires once the device has run it.
    pub fn submit(&self, request: RotaryRequest) -> Result<Completion> {
        let (completion, signal) = Completion::pending();
        self.send(Command::Rotary { request, signal })?;
        Ok(completion)
    }

    /// Block until every previously submitted command has finished.
    ///
    /// Faults of individual commands are reported through their own
    /// completions and [`last_error`](Self::last_error), not here.
    pub fn synchronize(&self) -> Result<()> {
        let (completion, signal) = Completion::pending();
        self.send(Command::Barrier(signal))?;
        completion.wait()
    }

    /// Most recent device fault, if any command has failed.
    pub fn last_error(&self) -> Option<RopeError> {
        self.last_error.lock().clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RopeError::Device("command queue closed".into()))?;
        sender
            .send(command)
            .map_err(|_| RopeError::Device("command queue worker is gone".into()))
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("command queue worker panicked");
        }
    }
}
