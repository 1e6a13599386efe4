use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::{NatError, Result};
use crate::providers::RetryParams;

/// Retries calls whose failure carries a configured status code or message.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub retry_on_status_codes: Vec<u16>,
    pub retry_on_errors: Vec<String>,
}

impl RetryPolicy {
    pub fn from_params(params: &RetryParams) -> Self {
        Self {
            max_retries: params.num_retries,
            backoff: Duration::from_millis(200),
            retry_on_status_codes: params.retry_on_status_codes.clone(),
            retry_on_errors: params.retry_on_errors.clone(),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn should_retry(&self, err: &NatError) -> bool {
        if let Some(status) = err.status_code() {
            if self.retry_on_status_codes.contains(&status) {
                return true;
            }
        }
        let message = err.to_string();
        self.retry_on_errors
            .iter()
            .any(|needle| message.contains(needle.as_str()))
    }

    pub async fn retry<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_retries || !self.should_retry(&err) {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "retrying failed call");
                    sleep(self.backoff * (attempt + 1)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::from_params(&RetryParams {
            num_retries: max_retries,
            ..RetryParams::default()
        })
        .with_backoff(Duration::from_millis(1))
    }

    fn rate_limited() -> NatError {
        NatError::Http {
            provider: "openai".into(),
            status: 429,
            body: "slow down".into(),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let res = policy(2)
            .retry(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(rate_limited())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = policy(1)
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            })
            .await;
        assert_eq!(res.unwrap_err().status_code(), Some(429));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_unlisted_errors() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = policy(3)
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NatError::LanguageModel("bad request".into())) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn matches_error_messages() {
        let policy = policy(1);
        assert!(policy.should_retry(&NatError::LanguageModel("429 Too Many Requests".into())));
        assert!(!policy.should_retry(&NatError::Http {
            provider: "nim".into(),
            status: 400,
            body: "invalid".into(),
        }));
    }
}
