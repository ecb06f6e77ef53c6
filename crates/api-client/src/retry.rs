use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use opsdesk_runtime_config::ClarificationSettings;
use tracing::warn;

/// Backoff schedule for clarification service calls.
///
/// One retry per entry in `delays`; an empty schedule disables retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub delays: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &ClarificationSettings) -> Self {
        Self {
            delays: settings.retry_delays(),
        }
    }

    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the schedule is exhausted. The last error is returned as is.
pub async fn retry<T, E, F, Fut>(
    config: &RetryConfig,
    label: &str,
    should_retry: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.delays.len() && should_retry(&e) => {
                let delay = config.delays[attempt];
                warn!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}…",
                    label,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
