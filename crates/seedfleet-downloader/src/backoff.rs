use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::DownloaderError;

/// Maximum attempts for an idempotent request.
pub(crate) const MAX_RETRIES: u32 = 3;

const BASE_DELAY_SECS: f64 = 0.5;
const MAX_DELAY_SECS: f64 = 10.0;

/// Delay before retry `attempt` (0-based): `0.5 * 2^attempt + jitter`, capped.
fn retry_delay(attempt: u32) -> Duration {
    let jitter: f64 = rand::rng().random_range(0.0..0.5);
    let secs = (BASE_DELAY_SECS * f64::from(1u32 << attempt) + jitter).min(MAX_DELAY_SECS);
    Duration::from_secs_f64(secs)
}

/// Run an idempotent operation with exponential backoff.
///
/// Only transient failures are retried; everything else propagates
/// immediately. Non-idempotent operations must not go through here.
pub(crate) async fn retry_idempotent<T, F, Fut>(
    endpoint: &str,
    mut op: F,
) -> Result<T, DownloaderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DownloaderError>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(
                    endpoint,
                    attempt = attempt + 1,
                    error = %err,
                    "transient adapter failure, backing off"
                );
                last_err = Some(err);
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(DownloaderError::NotConnected))
}
