use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Signal {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// Background thread running a task at a fixed interval until stopped.
///
/// The task returns `false` once there is nothing left to work on (its pool is gone), which ends
/// the thread as well.
#[derive(Debug)]
pub(crate) struct Evictor {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl Evictor {
    pub(crate) fn start<F>(interval: Duration, mut task: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let shared = Arc::clone(&signal);

        let thread = thread::Builder::new()
            .name("hotrod-evictor".to_string())
            .spawn(move || {
                let mut stopped = shared.stopped.lock();
                loop {
                    if *stopped {
                        break;
                    }
                    shared.wakeup.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    if !MutexGuard::unlocked(&mut stopped, || task()) {
                        break;
                    }
                }
                debug!("evictor thread exiting");
            })?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    fn signal_stop(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.wakeup.notify_all();
    }

    /// Stops the thread and waits for a running pass to finish.
    pub(crate) fn stop(mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
