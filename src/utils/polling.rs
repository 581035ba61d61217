//! Polling with a deadline, used to wait for objects to reach a state.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Outcome of a single poll attempt
pub enum Attempt<T> {
    /// The awaited state was reached
    Ready(T),
    /// Not yet; the message describes what is still missing
    Retry(String),
}

/// Configuration for polling operations
#[derive(Clone, Debug)]
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    pub fn new(timeout: Duration, interval: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            interval,
            description: description.into(),
        }
    }

    /// Poll until `condition` reports [`Attempt::Ready`], an error, or the deadline passes.
    ///
    /// The condition is always evaluated at least once. On timeout the last retry message is
    /// carried in [`Error::Timeout`].
    pub async fn poll<F, Fut, T>(&self, mut condition: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let deadline = Instant::now() + self.timeout;

        loop {
            let last_error = match condition().await? {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Retry(message) => message,
            };

            if Instant::now() + self.interval > deadline {
                return Err(Error::Timeout {
                    what: self.description.clone(),
                    timeout: self.timeout,
                    last_error,
                });
            }

            debug!("Waiting for {}: {}", self.description, last_error);
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn poll_returns_once_ready() {
        let counter = &AtomicU32::new(0);
        let config = PollingConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "counter",
        );

        let value = config
            .poll(|| async move {
                let val = counter.fetch_add(1, Ordering::SeqCst);
                if val >= 2 {
                    Ok(Attempt::Ready(val))
                } else {
                    Ok(Attempt::Retry(format!("only at {val}")))
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_with_last_error() {
        let config = PollingConfig::new(Duration::from_secs(5), Duration::from_secs(1), "nothing");

        let err = config
            .poll(|| async { Ok::<_, Error>(Attempt::<()>::Retry("still missing".into())) })
            .await
            .unwrap_err();

        match err {
            Error::Timeout {
                what, last_error, ..
            } => {
                assert_eq!(what, "nothing");
                assert_eq!(last_error, "still missing");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_propagates_errors() {
        let config = PollingConfig::new(Duration::from_secs(5), Duration::from_secs(1), "broken");

        let err = config
            .poll(|| async { Err::<Attempt<()>, _>(Error::InvalidConfig("boom".into())) })
            .await
            .unwrap_err();

        assert_eq!(err.metric_label(), "InvalidConfig");
    }
}
