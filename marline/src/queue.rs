use crate::logging::{self, Logger};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Single-consumer work queue: items pushed from any thread are handed to the
/// consumer callback on a dedicated thread, in push order. `quit` drains
/// whatever is still queued before the thread exits; a panicking callback is
/// logged and the consumer moves on to the next item.
pub struct Queue<T> {
    tx: Mutex<Option<Sender<T>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Queue<T> {
    pub fn spawn<F>(name: &str, log: Logger, mut consume: F) -> Queue<T>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                // Iteration keeps yielding buffered items after the sender is
                // dropped, which is exactly the drain-then-exit shutdown.
                for item in rx {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| consume(item))) {
                        logging::error!(log, "consumer panicked";
                                        "context" => "queue",
                                        "panic" => format!("{:?}", payload));
                    }
                }
            })
            .expect("queue thread must spawn");

        Queue {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues an item, handing it back if the queue has already shut down.
    pub fn push(&self, item: T) -> Result<(), T> {
        match self.tx.lock().unwrap_or_else(|err| err.into_inner()).as_ref() {
            Some(tx) => tx.send(item).map_err(|err| err.0),
            None => Err(item),
        }
    }
}

impl<T> Queue<T> {
    /// Stops accepting items, drains the backlog and joins the consumer
    /// thread. Safe to call more than once.
    pub fn quit(&self) {
        let sender = self.tx.lock().unwrap_or_else(|err| err.into_inner()).take();
        drop(sender);

        let handle = self.handle.lock().unwrap_or_else(|err| err.into_inner()).take();
        if let Some(handle) = handle {
            drop(handle.join());
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.quit();
    }
}
