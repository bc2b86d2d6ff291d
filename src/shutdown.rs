use tokio::sync::watch;

/// Create a linked shutdown handle/signal pair.
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// Owning side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal all observers to stop. In-flight work is drained, not killed.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of the shutdown signal, cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is triggered. A dropped handle counts as
    /// triggered: the process is going away either way.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_all_observers() {
        let (handle, shutdown) = shutdown_channel();
        let observer = shutdown.clone();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(async move { observer.triggered().await });
        handle.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("observer did not wake")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_triggered() {
        let (handle, shutdown) = shutdown_channel();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .expect("observer did not wake");
    }
}
