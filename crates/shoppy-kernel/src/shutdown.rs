//! Cooperative shutdown signal.
//!
//! Every long-running loop holds a [`Shutdown`] and selects on
//! [`Shutdown::wait`] next to its own work.  Firing the [`ShutdownTrigger`]
//! wakes all of them at once.

use tokio::sync::watch;

/// Owning side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Observing side of the shutdown signal.  Clone one per task.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

/// Create a connected trigger/observer pair.
pub fn shutdown_pair() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    /// Request shutdown.  Idempotent.
    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    /// Create another observer.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown(self.0.subscribe())
    }
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown has been requested (or the trigger was dropped).
    pub async fn wait(&mut self) {
        // An error means the trigger is gone; nobody can ask us to keep running.
        let _ = self.0.wait_for(|requested| *requested).await;
    }
}
