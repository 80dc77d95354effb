use crate::logging::{self, Logger};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Periodic background task. The callback runs once per period on a dedicated
/// thread until `quit` is called; a panicking callback is logged at the tick
/// boundary and the ticker keeps running.
pub struct Ticker {
    quit: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub fn spawn<F>(name: &str, period: Duration, log: Logger, mut tick: F) -> Ticker
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| tick())) {
                            logging::error!(log, "tick panicked";
                                            "context" => "ticker",
                                            "panic" => format!("{:?}", payload));
                        }
                    }
                    // Sender dropped or an explicit quit signal arrived.
                    _ => break,
                }
            })
            .expect("ticker thread must spawn");

        Ticker {
            quit: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the ticker and joins its thread. Safe to call more than once;
    /// the thread exits within one period.
    pub fn quit(&self) {
        let sender = self.quit.lock().unwrap_or_else(|err| err.into_inner()).take();
        drop(sender);

        let handle = self.handle.lock().unwrap_or_else(|err| err.into_inner()).take();
        if let Some(handle) = handle {
            drop(handle.join());
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.quit();
    }
}
