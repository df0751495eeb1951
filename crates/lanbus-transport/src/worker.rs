//! Background tasks with a two-phase start.
//!
//! [`Worker::spawn`] launches the task and hands back a [`StartingWorker`].
//! [`StartingWorker::await_ready`] then waits until the task body calls
//! [`ReadySignal::notify`], which a loop does right before it starts
//! polling. Once `await_ready` returns, a shutdown request can't slip in
//! before the loop has looked at its running flag for the first time.

use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::TransportError;

/// Handed to a worker's body; consumed to announce that the body reached
/// its loop.
#[derive(Debug)]
pub struct ReadySignal {
    tx: oneshot::Sender<()>,
}

impl ReadySignal {
    pub fn notify(self) {
        // The starter may have given up waiting; nothing to do then.
        let _ = self.tx.send(());
    }
}

/// A spawned worker whose body has not yet signalled readiness.
#[must_use = "a starting worker must be awaited with `await_ready`"]
pub struct StartingWorker {
    name: String,
    handle: JoinHandle<()>,
    ready: oneshot::Receiver<()>,
}

impl StartingWorker {
    /// Waits until the body signals readiness.
    ///
    /// # Errors
    /// [`TransportError::WorkerExited`] if the body returned (or panicked)
    /// without signalling. The task has already been joined in that case.
    pub async fn await_ready(self) -> Result<Worker, TransportError> {
        let StartingWorker {
            name,
            handle,
            ready,
        } = self;

        match ready.await {
            Ok(()) => {
                tracing::trace!(worker = %name, "worker ready");
                Ok(Worker { name, handle })
            }
            Err(_) => {
                let _ = handle.await;
                Err(TransportError::WorkerExited(name))
            }
        }
    }
}

/// A running background task.
pub struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns `body` on the Tokio runtime, passing it the signal it must
    /// fire once it is inside its loop.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> StartingWorker
    where
        F: FnOnce(ReadySignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (tx, ready) = oneshot::channel();
        let handle = tokio::spawn(body(ReadySignal { tx }));
        StartingWorker {
            name,
            handle,
            ready,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to finish. A panic inside the task is logged,
    /// not propagated.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!(worker = %self.name, "worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_await_ready_returns_after_body_signals() {
        let inside_loop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&inside_loop);

        let worker = Worker::spawn("test-worker", move |ready| async move {
            flag.store(true, Ordering::SeqCst);
            ready.notify();
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .await_ready()
        .await
        .expect("worker should become ready");

        assert!(inside_loop.load(Ordering::SeqCst));
        assert_eq!(worker.name(), "test-worker");
        worker.join().await;
    }

    #[tokio::test]
    async fn test_await_ready_fails_when_body_never_signals() {
        let result = Worker::spawn("quitter", |_ready| async {})
            .await_ready()
            .await;
        assert!(matches!(result, Err(TransportError::WorkerExited(name)) if name == "quitter"));
    }

    #[tokio::test]
    async fn test_join_survives_panicking_body() {
        let worker = Worker::spawn("panicker", |ready| async move {
            ready.notify();
            panic!("boom");
        })
        .await_ready()
        .await
        .expect("signalled before panicking");

        worker.join().await;
    }

    #[tokio::test]
    async fn test_is_finished_after_body_returns() {
        let worker = Worker::spawn("short", |ready| async move {
            ready.notify();
        })
        .await_ready()
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.is_finished());
        worker.join().await;
    }
}
