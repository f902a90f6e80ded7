// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # JSON Wire Format
//!
//! This module is the single serialization boundary of the bus. Payloads travel
//! as JSON documents and timestamps travel as ISO-8601 strings with exactly
//! three millisecond digits, either `Z`-suffixed or with a numeric offset.
//! Anything else, including two or four fractional digits, is left as a plain
//! string by [`parse_timestamp`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

use crate::errors::AmqpError;

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

const UTC_TIMESTAMP_LEN: usize = 24;
const OFFSET_TIMESTAMP_LEN: usize = 29;

/// Serializes a payload into the JSON body of a message.
///
/// # Returns
///
/// The encoded bytes, or `AmqpError::SerializePayloadError` if the payload
/// cannot be represented as JSON.
pub fn encode<T>(payload: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize,
{
    match serde_json::to_vec(payload) {
        Ok(body) => Ok(body),
        Err(err) => {
            error!(error = err.to_string(), "failure to serialize the payload");
            Err(AmqpError::SerializePayloadError)
        }
    }
}

/// Deserializes the JSON body of a message.
///
/// # Returns
///
/// The decoded payload, or `AmqpError::ParsePayloadError` if the body is not
/// valid JSON for the target type.
pub fn decode<T>(body: &[u8]) -> Result<T, AmqpError>
where
    T: DeserializeOwned,
{
    match serde_json::from_slice::<T>(body) {
        Ok(payload) => Ok(payload),
        Err(err) => {
            error!(error = err.to_string(), "failure to parse the payload");
            Err(AmqpError::ParsePayloadError)
        }
    }
}

/// Parses a wire timestamp, accepting only the two exact shapes
/// `YYYY-MM-DDTHH:MM:SS.mmmZ` and `YYYY-MM-DDTHH:MM:SS.mmm±HH:MM`.
///
/// # Returns
///
/// The UTC instant, or `None` when the string does not have one of the two
/// shapes or does not name a real calendar date.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if !has_timestamp_shape(value) {
        return None;
    }
    if value.ends_with('Z') {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3fZ")
            .ok()
            .map(|naive| naive.and_utc())
    } else {
        DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3f%:z")
            .ok()
            .map(|fixed| fixed.with_timezone(&Utc))
    }
}

/// Formats a UTC instant into the wire shape `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// Positional pre-check so that chrono never sees inputs it would parse more
// loosely than the wire format allows, such as five-digit years.
fn has_timestamp_shape(value: &str) -> bool {
    fn date_and_millis(b: &[u8]) -> bool {
        const DIGITS: [usize; 17] = [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18, 20, 21, 22];

        b[4] == b'-'
            && b[7] == b'-'
            && b[10] == b'T'
            && b[13] == b':'
            && b[16] == b':'
            && b[19] == b'.'
            && DIGITS.iter().all(|&i| b[i].is_ascii_digit())
    }

    let bytes = value.as_bytes();
    match bytes.len() {
        UTC_TIMESTAMP_LEN => date_and_millis(bytes) && bytes[23] == b'Z',
        OFFSET_TIMESTAMP_LEN => {
            date_and_millis(bytes)
                && (bytes[23] == b'+' || bytes[23] == b'-')
                && bytes[24].is_ascii_digit()
                && bytes[25].is_ascii_digit()
                && bytes[26] == b':'
                && bytes[27].is_ascii_digit()
                && bytes[28].is_ascii_digit()
        }
        _ => false,
    }
}

/// Serde adapter for `DateTime<Utc>` fields carried in the wire format, used
/// as `#[serde(with = "amqp_bus::codec::timestamp")]`.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp `{}`", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::{json, Value};

    #[test]
    fn parse_accepts_three_millisecond_digits() {
        let parsed = parse_timestamp("2017-04-01T01:02:03.406Z").unwrap();

        assert_eq!(format_timestamp(&parsed), "2017-04-01T01:02:03.406Z");
    }

    #[test]
    fn parse_normalizes_offsets_to_utc() {
        let parsed = parse_timestamp("2017-04-01T03:02:03.406+02:00").unwrap();

        assert_eq!(format_timestamp(&parsed), "2017-04-01T01:02:03.406Z");
    }

    #[test]
    fn parse_rejects_other_millisecond_widths() {
        assert_eq!(parse_timestamp("2017-04-01T01:02:03.40Z"), None);
        assert_eq!(parse_timestamp("2017-04-01T01:02:03.4067Z"), None);
        assert_eq!(parse_timestamp("2017-04-01T01:02:03Z"), None);
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp("2017-04-01 01:02:03.406Z"), None);
        assert_eq!(parse_timestamp("2017-04-01T01:02:03.406+0200"), None);
    }

    #[test]
    fn parse_rejects_impossible_calendar_dates() {
        assert_eq!(parse_timestamp("2017-13-01T01:02:03.406Z"), None);
        assert_eq!(parse_timestamp("2017-02-30T01:02:03.406Z"), None);
    }

    #[test]
    fn encode_then_decode_preserves_typed_timestamps() {
        #[derive(Debug, PartialEq, serde::Serialize, Deserialize)]
        struct Event {
            id: u64,
            #[serde(with = "super::timestamp")]
            received_at: chrono::DateTime<chrono::Utc>,
        }

        let event = Event {
            id: 7,
            received_at: parse_timestamp("2017-04-01T01:02:03.406Z").unwrap(),
        };

        let body = encode(&event).unwrap();
        let raw: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw["received_at"], json!("2017-04-01T01:02:03.406Z"));

        let back: Event = decode(&body).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn typed_decode_rejects_two_digit_millis() {
        #[derive(Debug, Deserialize)]
        struct Event {
            #[serde(with = "super::timestamp")]
            #[allow(dead_code)]
            received_at: chrono::DateTime<chrono::Utc>,
        }

        let result = decode::<Event>(br#"{"received_at":"2017-04-01T01:02:03.40Z"}"#);

        assert_eq!(result.unwrap_err(), AmqpError::ParsePayloadError);
    }

    #[test]
    fn untyped_decode_keeps_near_miss_strings() {
        let raw: Value = decode(br#"{"at":"2017-04-01T01:02:03.40Z"}"#).unwrap();

        assert_eq!(raw["at"], json!("2017-04-01T01:02:03.40Z"));
    }

    #[test]
    fn decode_maps_invalid_json_to_parse_error() {
        let result = decode::<Value>(b"{ not json");

        assert_eq!(result.unwrap_err(), AmqpError::ParsePayloadError);
    }
}
