//! Renewal timing.
//!
//! A certificate is renewed `renew_before` ahead of its expiry, but never
//! before it became valid. Failed issuances back off from the time of the
//! last failure.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::trace;

use warden_common::Backoff;

/// Backoff applied between failed issuance attempts of a certificate.
pub const FAILURE_BACKOFF: Backoff = Backoff::new(
    Duration::from_secs(3600),
    Duration::from_secs(32 * 3600),
);

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Renew-before used when a certificate does not set one: a third of the
/// validity, at least `floor`, and never longer than the validity itself.
pub fn default_renew_before(validity: Duration, floor: Duration) -> Duration {
    (validity / 3).max(floor).min(validity)
}

/// When to renew a certificate valid from `not_before` to `not_after`.
///
/// A `renew_before` longer than the validity window yields `not_before`.
pub fn renewal_time(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    renew_before: Duration,
) -> DateTime<Utc> {
    let at = not_after
        .checked_sub_signed(chrono_duration(renew_before))
        .unwrap_or(not_before);
    let at = at.max(not_before);
    trace!(%not_before, %not_after, renew_before_secs = renew_before.as_secs(), renewal = %at, "Computed renewal time");
    at
}

/// Renewal time for a certificate, using `requested` renew-before or the default.
pub fn renewal_time_for(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    requested: Option<Duration>,
    floor: Duration,
) -> DateTime<Utc> {
    let validity = (not_after - not_before).to_std().unwrap_or(Duration::ZERO);
    let renew_before = requested.unwrap_or_else(|| default_renew_before(validity, floor));
    renewal_time(not_before, not_after, renew_before)
}

/// Earliest time the next issuance may start after `failed_attempts`
/// consecutive failures, the last at `last_failure`.
pub fn next_attempt_after_failure(
    backoff: &Backoff,
    last_failure: DateTime<Utc>,
    failed_attempts: u32,
) -> DateTime<Utc> {
    let delay = backoff.delay(failed_attempts.saturating_sub(1));
    last_failure + chrono_duration(delay)
}
