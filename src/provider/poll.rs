//! Bounded polling shared by the provider adapters.

use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use super::ProviderError;

/// Interval between public address probes.
pub const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Budget for a public address to appear.
pub const ADDRESS_WAIT_TIMEOUT: Duration = Duration::from_secs(180);

/// Calls `probe` every `interval` until it yields a value or `timeout`
/// elapses. Returns within `timeout` plus one interval and one probe.
///
/// # Errors
///
/// Returns the first error `probe` reports, or [`ProviderError::Timeout`]
/// naming `what` when the budget runs out.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ProviderError>>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() <= deadline {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        sleep(interval).await;
    }
    Err(ProviderError::Timeout {
        what: what.to_owned(),
        after: timeout,
    })
}

/// Parses a provider-reported address, treating the unspecified address
/// (`0.0.0.0`, which some providers report while still allocating) and
/// garbage as "not yet known".
#[must_use]
pub fn usable_address(raw: &str) -> Option<IpAddr> {
    IpAddr::from_str(raw.trim())
        .ok()
        .filter(|address| !address.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[rstest]
    #[case("203.0.113.7", true)]
    #[case("0.0.0.0", false)]
    #[case("", false)]
    #[case("pending", false)]
    #[case("2001:db8::1", true)]
    fn recognises_usable_addresses(#[case] raw: &str, #[case] usable: bool) {
        assert_eq!(usable_address(raw).is_some(), usable);
    }

    #[tokio::test]
    async fn returns_first_available_value() {
        let calls = AtomicUsize::new(0);
        let value = poll_until("address", Duration::from_millis(1), Duration::from_secs(1), || {
            let seen = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((seen >= 2).then_some(seen)) }
        })
        .await
        .expect("value");
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn times_out_within_bound_plus_one_interval() {
        let interval = Duration::from_millis(20);
        let timeout = Duration::from_millis(100);
        let started = Instant::now();

        let err = poll_until::<(), _, _>("address", interval, timeout, || async { Ok(None) })
            .await
            .expect_err("timeout");

        assert!(matches!(err, ProviderError::Timeout { .. }));
        assert!(started.elapsed() <= timeout + interval + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn probe_errors_stop_polling() {
        let calls = AtomicUsize::new(0);
        let err = poll_until::<(), _, _>(
            "address",
            Duration::from_millis(1),
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::Api {
                        operation: String::from("get"),
                        message: String::from("boom"),
                    })
                }
            },
        )
        .await
        .expect_err("error");
        assert!(matches!(err, ProviderError::Api { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
