//! Small timing utilities shared by the engine.
//!
//! Why: keep time-based behavior explicit and runtime-agnostic. Everything
//! here is built on `futures-timer`, so the core never assumes a runtime.
use futures::future::Either;

/// The future did not finish inside its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// Race `fut` against a deadline.
///
/// Dropping the returned future drops `fut` as well, so a caller backing out
/// never leaves work running behind its back.
pub async fn timeout<F>(duration: std::time::Duration, fut: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    let delay = futures_timer::Delay::new(duration);
    futures::pin_mut!(fut);
    futures::pin_mut!(delay);

    match futures::future::select(fut, delay).await {
        Either::Left((out, _)) => Ok(out),
        Either::Right(((), _)) => Err(Elapsed),
    }
}

/// Sleep without tying the caller to a runtime.
pub async fn sleep(duration: std::time::Duration) {
    futures_timer::Delay::new(duration).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_returns_value_when_future_wins() {
        let out = timeout(std::time::Duration::from_secs(5), async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn timeout_elapses_on_slow_future() {
        let out = timeout(
            std::time::Duration::from_millis(10),
            std::future::pending::<()>(),
        )
        .await;
        assert_eq!(out, Err(Elapsed));
    }
}
