// 10.0: background loops. one spawned task per loop, ticking on a tokio interval,
// stopped through a watch channel. a tick that is still running finishes before stop returns.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct PeriodicTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the loop. The first tick fires immediately.
    /// Returns false if it was already running.
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("{} already running", self.name);
            return false;
        }

        let (shutdown, mut signal) = watch::channel(false);
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("{} loop exited", name);
        });

        info!("Started {} (every {:?})", self.name, period);
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Signal the loop and wait for it to exit. Returns false if it wasn't running.
    pub async fn stop(&self) -> bool {
        let taken = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(running) = taken else {
            return false;
        };
        let _ = running.shutdown.send(true);
        let _ = running.handle.await;
        info!("Stopped {}", self.name);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(r) = running.take() {
                r.handle.abort();
            }
        }
    }
}
