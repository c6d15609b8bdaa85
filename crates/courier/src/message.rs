//! Transport message representation and the reserved header protocol.
//!
//! A [`TransportMessage`] is deliberately dumb: a string-to-string header
//! map plus an opaque body. Everything the bus needs to schedule a message
//! (priority, deferral, time-to-live, ordering) travels in reserved
//! `rbs2-*` headers so that any transport can interpret them without
//! knowing anything about the payload encoding.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::TransportError;

/// Reserved header keys understood by transports.
pub mod headers {
    /// Globally unique id of the message, assigned by the sender.
    pub const MESSAGE_ID: &str = "rbs2-msg-id";

    /// Integer delivery priority. Higher values are delivered first.
    /// Defaults to 0 when absent.
    pub const PRIORITY: &str = "rbs2-msg-priority";

    /// ISO-8601 instant before which the message must not be delivered.
    /// Consumed by the transport and stripped before the row is written.
    pub const DEFERRED_UNTIL: &str = "rbs2-deferred-until";

    /// Queue that a deferred message should be delivered to once due.
    pub const DEFERRED_RECIPIENT: &str = "rbs2-deferred-recipient";

    /// How long the message stays deliverable after being sent. Accepts
    /// plain integer seconds or `[days.]HH:MM:SS`.
    pub const TIME_TO_BE_RECEIVED: &str = "rbs2-time-to-be-received";

    /// Ordering key: messages sharing a key are processed one at a time,
    /// in enqueue order, across the entire fleet.
    pub const ORDERING_KEY: &str = "rbs2-ordering-key";
}

/// Sentinel destination used by bus runtimes that route deferred messages
/// through an external timeout manager. A transport that handles deferrals
/// natively resolves the real destination from
/// [`headers::DEFERRED_RECIPIENT`] instead.
pub const MAGIC_DEFERRAL_ADDRESS: &str = "##### MagicExternalTimeoutManagerAddress #####";

/// A message as seen by a transport: headers plus opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// The header map. Reserved keys are defined in [`headers`].
    pub headers: HashMap<String, String>,
    /// The serialized payload. Transports never look inside.
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Create a message from parts.
    pub fn new(headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Delivery priority from [`headers::PRIORITY`], defaulting to 0.
    ///
    /// A present-but-unparseable value is a fatal
    /// [`TransportError::MalformedMessage`]: the sender put garbage in a
    /// reserved header and retrying will not fix it.
    pub fn priority(&self) -> Result<i32, TransportError> {
        match self.headers.get(headers::PRIORITY) {
            None => Ok(0),
            Some(raw) => raw.trim().parse().map_err(|_| {
                TransportError::MalformedMessage(format!(
                    "header '{}' must be an integer, got {raw:?}",
                    headers::PRIORITY
                ))
            }),
        }
    }

    /// The instant before which the message must stay invisible, if any.
    pub fn deferred_until(&self) -> Result<Option<DateTime<Utc>>, TransportError> {
        match self.headers.get(headers::DEFERRED_UNTIL) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| {
                    TransportError::MalformedMessage(format!(
                        "header '{}' is not an ISO-8601 instant ({e}): {raw:?}",
                        headers::DEFERRED_UNTIL
                    ))
                }),
        }
    }

    /// Time-to-be-received from [`headers::TIME_TO_BE_RECEIVED`], if any.
    pub fn time_to_be_received(&self) -> Result<Option<Duration>, TransportError> {
        match self.headers.get(headers::TIME_TO_BE_RECEIVED) {
            None => Ok(None),
            Some(raw) => parse_duration(raw).map(Some).map_err(|e| {
                TransportError::MalformedMessage(format!(
                    "header '{}': {e}: {raw:?}",
                    headers::TIME_TO_BE_RECEIVED
                ))
            }),
        }
    }

    /// Ordering key, if the sender set one.
    pub fn ordering_key(&self) -> Option<&str> {
        self.headers.get(headers::ORDERING_KEY).map(String::as_str)
    }
}

/// Encode a header map into the opaque byte form stored in queue tables.
///
/// Receivers must treat the encoding as opaque; only [`decode_headers`] is
/// guaranteed to understand it.
pub fn encode_headers(headers: &HashMap<String, String>) -> Vec<u8> {
    // Serializing a string map cannot fail.
    serde_json::to_vec(headers).expect("header map serialization is infallible")
}

/// Decode a header map previously produced by [`encode_headers`].
pub fn decode_headers(bytes: &[u8]) -> Result<HashMap<String, String>, TransportError> {
    serde_json::from_slice(bytes)
        .map_err(|e| TransportError::MalformedMessage(format!("undecodable header map: {e}")))
}

/// Parse a duration given as plain integer seconds or `[days.]HH:MM:SS`.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(seconds) = raw.parse::<i64>() {
        if seconds < 0 {
            return Err("duration must not be negative".into());
        }
        return Ok(Duration::seconds(seconds));
    }

    let (days, clock) = match raw.split_once('.') {
        Some((d, rest)) => (
            d.parse::<i64>().map_err(|_| format!("bad day count {d:?}"))?,
            rest,
        ),
        None => (0, raw),
    };
    let mut parts = clock.split(':');
    let (h, m, s) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s), None) => (h, m, s),
        _ => return Err("expected [days.]HH:MM:SS".into()),
    };
    let h: i64 = h.parse().map_err(|_| format!("bad hours {h:?}"))?;
    let m: i64 = m.parse().map_err(|_| format!("bad minutes {m:?}"))?;
    let s: i64 = s.parse().map_err(|_| format!("bad seconds {s:?}"))?;
    if days < 0 || h < 0 || !(0..60).contains(&m) || !(0..60).contains(&s) {
        return Err("field out of range".into());
    }
    Ok(Duration::seconds(((days * 24 + h) * 60 + m) * 60 + s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_with(key: &str, value: &str) -> TransportMessage {
        let mut headers = HashMap::new();
        headers.insert(key.to_string(), value.to_string());
        TransportMessage::new(headers, b"{}".to_vec())
    }

    #[test]
    fn priority_defaults_to_zero() {
        let msg = TransportMessage::new(HashMap::new(), Vec::new());
        assert_eq!(msg.priority().unwrap(), 0);
    }

    #[test]
    fn priority_parses_integers() {
        assert_eq!(msg_with(headers::PRIORITY, "17").priority().unwrap(), 17);
        assert_eq!(msg_with(headers::PRIORITY, "-3").priority().unwrap(), -3);
    }

    #[test]
    fn garbage_priority_is_malformed() {
        let err = msg_with(headers::PRIORITY, "high").priority().unwrap_err();
        assert!(matches!(err, TransportError::MalformedMessage(_)));
    }

    #[test]
    fn deferred_until_parses_rfc3339() {
        let msg = msg_with(headers::DEFERRED_UNTIL, "2026-03-01T12:30:00Z");
        let t = msg.deferred_until().unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2026-03-01T12:30:00+00:00");
    }

    #[test]
    fn bad_deferral_is_malformed() {
        let msg = msg_with(headers::DEFERRED_UNTIL, "next tuesday");
        assert!(matches!(
            msg.deferred_until().unwrap_err(),
            TransportError::MalformedMessage(_)
        ));
    }

    #[test]
    fn ttl_accepts_seconds_and_clock_format() {
        let secs = msg_with(headers::TIME_TO_BE_RECEIVED, "90");
        assert_eq!(
            secs.time_to_be_received().unwrap().unwrap(),
            Duration::seconds(90)
        );

        let clock = msg_with(headers::TIME_TO_BE_RECEIVED, "01:30:00");
        assert_eq!(
            clock.time_to_be_received().unwrap().unwrap(),
            Duration::minutes(90)
        );

        let with_days = msg_with(headers::TIME_TO_BE_RECEIVED, "2.00:00:30");
        assert_eq!(
            with_days.time_to_be_received().unwrap().unwrap(),
            Duration::days(2) + Duration::seconds(30)
        );
    }

    #[test]
    fn ttl_rejects_nonsense() {
        for bad in ["", "1:2", "xx:00:00", "00:77:00", "-5"] {
            let msg = msg_with(headers::TIME_TO_BE_RECEIVED, bad);
            assert!(
                msg.time_to_be_received().is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn header_roundtrip() {
        let mut headers = HashMap::new();
        headers.insert(headers::MESSAGE_ID.to_string(), "abc-123".to_string());
        headers.insert("custom".to_string(), "value".to_string());
        let decoded = decode_headers(&encode_headers(&headers)).unwrap();
        assert_eq!(decoded, headers);
    }
}
