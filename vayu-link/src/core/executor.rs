//! Dedicated thread for user callbacks
//!
//! Receive threads hand decoded messages to [`CallbackList::queue`], which
//! pushes the calls here. User code therefore never runs on (or stalls) a
//! socket or serial read loop.
//!
//! [`CallbackList::queue`]: super::callback_list::CallbackList::queue

use super::callback_list::QueuedCallback;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io;
use std::thread::{self, JoinHandle};

/// Runs queued callbacks in FIFO order on one named thread
pub struct CallbackExecutor {
    sender: Option<Sender<QueuedCallback>>,
    thread: Option<JoinHandle<()>>,
}

impl CallbackExecutor {
    /// Spawn the executor thread
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<QueuedCallback>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver))?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Queue one callback
    pub fn enqueue(&self, work: QueuedCallback) {
        if let Some(sender) = &self.sender
            && sender.send(work).is_err()
        {
            log::warn!("Callback executor gone, dropping callback");
        }
    }
}

fn run(receiver: Receiver<QueuedCallback>) {
    log::debug!("Callback executor started");
    // Ends once every sender is dropped and the queue is drained.
    for work in receiver.iter() {
        work();
    }
    log::debug!("Callback executor stopped");
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            // Dropped from inside a callback: the thread can't join itself.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                log::error!("Callback executor panicked");
            }
        }
    }
}
