//! The UI-affine execution context that every listener and result callback
//! runs on.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use log::{error, warn};

use crate::error::{Error, Result};

pub type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// A serial executor bound to one logical thread. Tasks run in post order and
/// never concurrently with each other.
pub trait UiContext: Send + Sync {
    fn post(&self, task: UiTask) -> Result<()>;
}

/// Posts onto the slint event loop of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlintUiContext;

impl UiContext for SlintUiContext {
    fn post(&self, task: UiTask) -> Result<()> {
        slint::invoke_from_event_loop(task).map_err(|err| Error::UiContext(err.to_string()))
    }
}

/// A dedicated worker thread draining a bounded task queue, for hosts that
/// run without a toolkit event loop. A full queue makes posters wait for the
/// worker; tasks are never dropped.
pub struct DedicatedUiThread {
    tx: Mutex<Option<SyncSender<UiTask>>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    capacity: usize,
}

impl DedicatedUiThread {
    pub fn spawn(capacity: usize) -> Result<Arc<Self>> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::sync_channel::<UiTask>(capacity);

        let handle = thread::Builder::new()
            .name("reader-ui".to_string())
            .spawn(move || {
                for task in rx {
                    task();
                }
            })?;

        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            handle: Some(handle),
            capacity,
        }))
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl UiContext for DedicatedUiThread {
    fn post(&self, task: UiTask) -> Result<()> {
        let tx = {
            let Ok(guard) = self.tx.lock() else {
                return Err(Error::UiContext("task queue lock poisoned".to_string()));
            };
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(Error::UiContext("UI thread shut down".to_string())),
            }
        };

        // The worker cannot wait on its own queue.
        if thread::current().id() != self.thread_id {
            return tx
                .send(task)
                .map_err(|_| Error::UiContext("UI thread exited".to_string()));
        }

        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_task)) => {
                warn!("UI task queue full (cap={}) while posting from the UI thread", self.capacity);
                Err(Error::UiContext("queue full".to_string()))
            }
            Err(TrySendError::Disconnected(_task)) => {
                Err(Error::UiContext("UI thread exited".to_string()))
            }
        }
    }
}

impl Drop for DedicatedUiThread {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }

        let Some(handle) = self.handle.take() else {
            return;
        };

        // The last reference can be released by a task running on the worker.
        if thread::current().id() == self.thread_id {
            return;
        }

        if handle.join().is_err() {
            error!("UI thread panicked");
        }
    }
}

impl std::fmt::Debug for DedicatedUiThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedUiThread")
            .field("thread_id", &self.thread_id)
            .field("capacity", &self.capacity)
            .finish()
    }
}
