// Access token expiry decoding and renewal timing

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Renewal fires this many seconds before the access token expires
pub const RENEWAL_LEAD_SECS: i64 = 60;

/// Lead time as a chrono duration
pub fn renewal_lead_time() -> Duration {
    Duration::seconds(RENEWAL_LEAD_SECS)
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<serde_json::Value>,
}

/// Decode the `exp` claim (epoch seconds) from a JWT-shaped access token.
///
/// Returns `None` for anything malformed: wrong segment count, bad base64,
/// non-JSON claims, or a missing/non-numeric `exp`. A token we cannot read
/// simply cannot be renewed proactively.
pub fn decode_expiry(access_token: &str) -> Option<i64> {
    let mut segments = access_token.split('.');
    let (_header, claims, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Some issuers pad their segments even though JWT says not to
    let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;

    match claim.exp? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// Delay until proactive renewal should fire for a token expiring at `expiry`.
///
/// `None` means "do not schedule": the renewal instant is now or already past,
/// so the next protected call has to trigger a reactive refresh instead.
pub fn time_until_renewal(
    expiry: i64,
    now: DateTime<Utc>,
    lead_time: Duration,
) -> Option<std::time::Duration> {
    let renew_at = DateTime::<Utc>::from_timestamp(expiry, 0)?.checked_sub_signed(lead_time)?;
    let delay = renew_at.signed_duration_since(now);
    if delay <= Duration::zero() {
        return None;
    }
    delay.to_std().ok()
}

#[cfg(test)]
pub(crate) fn make_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "sub": "user-1", "exp": exp, "nonce": uuid::Uuid::new_v4() })
            .to_string(),
    );
    format!("{}.{}.signature", header, claims)
}
