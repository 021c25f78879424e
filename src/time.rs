//! Time helpers used across the engine so call sites stay uniform.

use chrono::{DateTime, Utc};

use std::{future::Future, time::Duration};

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) async fn timeout<F: Future>(
    duration: Duration,
    future: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    tokio::time::timeout(duration, future).await
}

pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
