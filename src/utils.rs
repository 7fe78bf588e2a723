//! Generic utilities.

use std::time::{Duration, Instant};

use futures_util::Future;
use rand::Rng;
use serde::de;
use tokio::net::TcpStream;

use crate::error::{Result, VoicelinkError};
use crate::model::ApiError;

/// Takes a request, waits for its execution and parses its json body.
///
/// If status code isn't between 200 and 299, tries to parse the [`ApiError`].
pub(crate) async fn process_request<T, R>(request: R) -> Result<T>
where
    T: de::DeserializeOwned,
    R: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let response = request.await.map_err(VoicelinkError::RequestError)?;

    if response.status().is_success() {
        return response
            .json::<T>()
            .await
            .map_err(VoicelinkError::ParseResponseError);
    }

    Err(api_error(response).await)
}

/// Same as [`process_request`], for endpoints that reply without a body.
pub(crate) async fn process_empty_request<R>(request: R) -> Result<()>
where
    R: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let response = request.await.map_err(VoicelinkError::RequestError)?;

    if response.status().is_success() {
        return Ok(());
    }

    Err(api_error(response).await)
}

async fn api_error(response: reqwest::Response) -> VoicelinkError {
    match response.json::<ApiError>().await {
        Ok(api_e) => VoicelinkError::InstanceError(api_e),
        Err(e) => VoicelinkError::ParseResponseError(e),
    }
}

/// Spawns a future.
pub(crate) fn spawn_fut<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future);
}

/// Time it takes to open a TCP connection with `host:port`.
///
/// Returns `None` if the connection fails or takes longer than `timeout`.
pub(crate) async fn tcp_latency(host: &str, port: u16, timeout: Duration) -> Option<Duration> {
    let start = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Some(start.elapsed()),
        _ => None,
    }
}

/// Randomized exponential backoff.
///
/// Each consecutive call doubles the upper bound of the next delay, up to
/// `base * 2^10` seconds. When more than `base * 2^11` seconds have passed
/// since the previous call, the exponent starts over.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: f64,
    exp: u32,
    max: u32,
    reset_time: Duration,
    last_invocation: Instant,
}

impl ExponentialBackoff {
    /// Creates a backoff with `base` seconds as unit.
    pub fn new(base: f64) -> Self {
        Self {
            base,
            exp: 0,
            max: 10,
            reset_time: Duration::from_secs_f64(base * 2_f64.powi(11)),
            last_invocation: Instant::now(),
        }
    }

    /// Returns the time to wait before the next attempt.
    pub fn delay(&mut self) -> Duration {
        self.delay_at(Instant::now())
    }

    fn delay_at(&mut self, invocation: Instant) -> Duration {
        let interval = invocation.saturating_duration_since(self.last_invocation);
        self.last_invocation = invocation;

        if interval > self.reset_time {
            self.exp = 0;
        }

        self.exp = (self.exp + 1).min(self.max);
        let upper = self.base * 2_f64.powi(self.exp as i32);

        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=upper))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = ExponentialBackoff::new(1.0);
        let now = Instant::now();

        for i in 1..=20 {
            let delay = backoff.delay_at(now);
            let upper = 2_f64.powi(i.min(10));
            assert!(delay.as_secs_f64() <= upper, "attempt {i}: {delay:?}");
        }
        assert_eq!(backoff.exp, 10);
    }

    #[test]
    fn test_backoff_resets_after_quiet_period() {
        let mut backoff = ExponentialBackoff::new(1.0);
        let now = Instant::now();

        for _ in 0..5 {
            backoff.delay_at(now);
        }
        assert_eq!(backoff.exp, 5);

        backoff.delay_at(now + Duration::from_secs(2049));
        assert_eq!(backoff.exp, 1);
    }

    #[tokio::test]
    async fn test_latency_of_unreachable_host() {
        let latency = tcp_latency("127.0.0.1", 1, Duration::from_millis(500)).await;

        assert!(latency.is_none());
    }
}
