//! Tokio-backed job spawner.
//!
//! Why: isolate runtime concerns behind [`JobSpawner`]. Tasks are detached
//! at spawn; the handle only observes completion and logs abnormal ends
//! instead of bubbling them into the executor.
use pin_project_lite::pin_project;

use crate::executor::JobSpawner;

/// Spawn execution futures onto the Tokio runtime.
pub struct TokioSpawner;

pin_project! {
    /// Wraps Tokio's `JoinHandle<()>`; completion-only, never propagates.
    pub struct TokioJoinHandle {
        #[pin]
        handle: tokio::task::JoinHandle<()>,
    }
}

impl Future for TokioJoinHandle {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        match this.handle.poll(cx) {
            std::task::Poll::Ready(result) => {
                if let Err(error) = result {
                    tracing::error!(error = %error, "execution task ended abnormally");
                }
                std::task::Poll::Ready(())
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl JobSpawner for TokioSpawner {
    type Handle = TokioJoinHandle;

    fn spawn<Fut>(fut: Fut) -> Self::Handle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        TokioJoinHandle {
            handle: tokio::spawn(fut),
        }
    }
}
