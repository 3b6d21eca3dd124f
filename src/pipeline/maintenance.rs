//! Dedicated thread for blocking cache housekeeping.
//!
//! Disk initialization, clearing, flushing and closing all touch the
//! filesystem, so they run here instead of on a worker.

use crate::cache::{CacheCommand, ImageCache};
use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const THREAD_NAME: &str = "cache-housekeeping";

struct Job {
    command: CacheCommand,
    done: Option<oneshot::Sender<()>>,
}

pub struct Housekeeper {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn spawn(cache: Arc<ImageCache>) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                debug!("Housekeeping thread started");
                while let Ok(job) = receiver.recv() {
                    info!("Running cache command {:?}", job.command);
                    cache.run(job.command);
                    if let Some(done) = job.done {
                        let _ = done.send(());
                    }
                }
                debug!("Housekeeping thread stopped");
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue a command. The receiver resolves once it has run, or errors if
    /// the thread has already stopped.
    pub fn submit(&self, command: CacheCommand) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let job = Job {
            command,
            done: Some(done),
        };
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Housekeeping thread is gone; dropped {:?}", command);
                }
            }
            None => warn!("Housekeeper stopped; dropped {:?}", command),
        }
        rx
    }

    /// Stop accepting commands and wait for queued ones to finish. Blocking.
    pub fn join(mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Housekeeping thread panicked");
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        // Closing the channel ends the thread once its queue drains
        self.sender.take();
    }
}
