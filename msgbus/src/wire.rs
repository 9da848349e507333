//! The external control-channel line protocol (spec.md §4.4): a
//! human-readable, colon-separated encoding of a [`Message`] for passing
//! across a pipe or socket to an out-of-process control client.
//!
//! Two line forms:
//! - outbound request: `%%>message:<id>:<epoch-secs>:<name>:<retval>:<k=v>:...`
//! - inbound reply: `%%<message:<id>:<received>:<name>:<retval>:<k=v>:...`
//!
//! Decoding is a position-preserving parser: on malformed input the return
//! value is the byte offset of the first bad character; `-1` means the line
//! did not start with the expected prefix; `-2` means success. This exact
//! contract (not just "ok or error") is relied on by callers that want to
//! point a human at the exact malformed byte, so it is kept verbatim rather
//! than translated into an idiomatic `Result`.

use chrono::{DateTime, TimeZone, Utc};

use crate::message::Message;

const REQUEST_PREFIX: &str = "%%>message:";
const REPLY_PREFIX: &str = "%%<message:";

/// Sentinel meaning "decoded successfully".
pub const DECODE_OK: i64 = -2;
/// Sentinel meaning "line does not start with the expected prefix".
pub const DECODE_PREFIX_MISMATCH: i64 = -1;

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b':' | b'=' | b'%' | 0x00..=0x1f => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
            _ => out.push(byte as char),
        }
    }
    out
}

/// Reverse of [`escape`]. Returns the byte offset of a malformed `%xx`
/// escape within `value`, if any.
fn unescape(value: &str) -> Result<String, usize> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3);
            let parsed = hex.and_then(|h| std::str::from_utf8(h).ok()).and_then(|h| u8::from_str_radix(h, 16).ok());
            match parsed {
                Some(byte) => {
                    out.push(byte);
                    i += 3;
                }
                None => return Err(i),
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    // The input is built only from `escape`'s output plus ASCII separators,
    // so the byte stream is always valid UTF-8.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn common_encode(msg: &Message, out: &mut String) {
    out.push_str(&escape(msg.name()));
    out.push(':');
    out.push_str(&escape(msg.retval()));
    for p in msg.params() {
        out.push(':');
        out.push_str(&escape(&p.name));
        out.push('=');
        out.push_str(&escape(&p.value));
    }
}

/// Encode `msg` as an outbound request line.
pub fn encode_request(msg: &Message, id: &str) -> String {
    let mut out = String::from(REQUEST_PREFIX);
    out.push_str(&escape(id));
    out.push(':');
    out.push_str(&msg.msg_time().timestamp().to_string());
    out.push(':');
    common_encode(msg, &mut out);
    out
}

/// Encode `msg` as an inbound reply line.
pub fn encode_reply(msg: &Message, received: bool, id: &str) -> String {
    let mut out = String::from(REPLY_PREFIX);
    out.push_str(&escape(id));
    out.push(':');
    out.push_str(if received { "true" } else { "false" });
    out.push(':');
    common_encode(msg, &mut out);
    out
}

/// A successfully decoded request or reply line.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub id: String,
    pub time: DateTime<Utc>,
    pub message: Message,
}

fn common_decode(rest: &str, base_offset: i64) -> Result<(String, String, Vec<(String, String)>), i64> {
    let mut parts = rest.split(':');

    let raw_name = parts.next().ok_or(base_offset)?;
    let name = unescape(raw_name).map_err(|off| base_offset + off as i64)?;

    let raw_retval = parts.next();
    let retval = match raw_retval {
        Some(chunk) => unescape(chunk).map_err(|off| {
            base_offset + raw_name.len() as i64 + 1 + off as i64
        })?,
        None => String::new(),
    };

    let mut params = Vec::new();
    let mut offset = base_offset + raw_name.len() as i64 + 1 + raw_retval.map(|s| s.len() as i64 + 1).unwrap_or(0);
    for chunk in parts {
        if chunk.is_empty() {
            offset += 1;
            continue;
        }
        let decoded = unescape(chunk).map_err(|off| offset + off as i64)?;
        match decoded.find('=') {
            Some(0) => return Err(offset),
            Some(pos) => params.push((decoded[..pos].to_string(), decoded[pos + 1..].to_string())),
            None => {
                // A bare name with no `=` clears that parameter; since a
                // freshly decoded message starts empty, there is nothing to
                // clear and the token is simply dropped.
            }
        }
        offset += chunk.len() as i64 + 1;
    }

    Ok((name, retval, params))
}

/// Decode an outbound request line. Returns [`DECODE_OK`] on success with
/// the decoded message, [`DECODE_PREFIX_MISMATCH`] if `line` does not start
/// with the request prefix, or the byte offset of the first malformed
/// character.
pub fn decode_request(line: &str) -> (i64, Option<Decoded>) {
    if !line.starts_with(REQUEST_PREFIX) {
        return (DECODE_PREFIX_MISMATCH, None);
    }
    let rest = &line[REQUEST_PREFIX.len()..];
    let Some(id_end) = rest.find(':') else {
        return (REQUEST_PREFIX.len() as i64, None);
    };
    let raw_id = &rest[..id_end];
    let id = match unescape(raw_id) {
        Ok(id) => id,
        Err(off) => return (REQUEST_PREFIX.len() as i64 + off as i64, None),
    };

    let after_id = &rest[id_end + 1..];
    let Some(time_end) = after_id.find(':') else {
        return (REQUEST_PREFIX.len() as i64 + id_end as i64, None);
    };
    let raw_time = &after_id[..time_end];
    let Ok(secs) = raw_time.parse::<i64>() else {
        return (REQUEST_PREFIX.len() as i64 + id_end as i64, None);
    };
    let time = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now);

    let common_offset = REQUEST_PREFIX.len() as i64 + id_end as i64 + 1 + time_end as i64 + 1;
    match common_decode(&after_id[time_end + 1..], common_offset) {
        Ok((name, retval, params)) => {
            let mut message = Message::new(name, retval, false);
            for (k, v) in params {
                message.add_param(k, v);
            }
            (
                DECODE_OK,
                Some(Decoded { id, time, message }),
            )
        }
        Err(offset) => (offset, None),
    }
}

/// Decode an inbound reply line for a specific `id`. Same sentinel
/// contract as [`decode_request`], plus the decoded `received` flag.
pub fn decode_reply(line: &str, id: &str) -> (i64, Option<(bool, Decoded)>) {
    let prefix = format!("{REPLY_PREFIX}{}:", escape(id));
    if !line.starts_with(&prefix) {
        return (DECODE_PREFIX_MISMATCH, None);
    }
    let rest = &line[prefix.len()..];
    let Some(recv_end) = rest.find(':') else {
        return (prefix.len() as i64, None);
    };
    let received = match &rest[..recv_end] {
        "true" => true,
        "false" => false,
        _ => return (prefix.len() as i64, None),
    };

    let common_offset = prefix.len() as i64 + recv_end as i64 + 1;
    match common_decode(&rest[recv_end + 1..], common_offset) {
        Ok((name, retval, params)) => {
            let mut message = Message::new(name, retval, false);
            for (k, v) in params {
                message.add_param(k, v);
            }
            (
                DECODE_OK,
                Some((
                    received,
                    Decoded {
                        id: id.to_string(),
                        time: Utc::now(),
                        message,
                    },
                )),
            )
        }
        Err(offset) => (offset, None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn request_round_trips_name_retval_and_params() {
        let mut msg = Message::new("call.route", "ok", false);
        msg.add_param("callto", "sip/1001");
        msg.add_param("caller", "1000");

        let line = encode_request(&msg, "42");
        let (status, decoded) = decode_request(&line);
        assert_eq!(status, DECODE_OK);
        let decoded = decoded.expect("decode succeeded");
        assert_eq!(decoded.id, "42");
        assert_eq!(decoded.message.name(), "call.route");
        assert_eq!(decoded.message.retval(), "ok");
        assert_eq!(decoded.message.get_param("callto"), Some("sip/1001"));
        assert_eq!(decoded.message.get_param("caller"), Some("1000"));
    }

    #[test]
    fn wrong_prefix_is_minus_one() {
        let (status, decoded) = decode_request("garbage");
        assert_eq!(status, DECODE_PREFIX_MISMATCH);
        assert!(decoded.is_none());
    }

    #[test]
    fn reply_round_trips_received_flag() {
        let msg = Message::new("call.route", "ok", false);
        let line = encode_reply(&msg, true, "7");
        let (status, decoded) = decode_reply(&line, "7");
        assert_eq!(status, DECODE_OK);
        let (received, decoded) = decoded.expect("decode succeeded");
        assert!(received);
        assert_eq!(decoded.message.name(), "call.route");
    }

    #[test]
    fn special_characters_in_params_escape_and_round_trip() {
        let mut msg = Message::new("call.route", "ok", false);
        msg.add_param("note", "a:b=c%d");
        let line = encode_request(&msg, "1");
        let (status, decoded) = decode_request(&line);
        assert_eq!(status, DECODE_OK);
        assert_eq!(decoded.unwrap().message.get_param("note"), Some("a:b=c%d"));
    }

    proptest! {
        #[test]
        fn request_round_trip_holds_for_arbitrary_ascii(
            name in "[a-zA-Z0-9._]{1,16}",
            retval in "[ -~]{0,24}",
            key in "[a-zA-Z0-9._]{1,8}",
            value in "[ -~]{0,24}",
        ) {
            let mut msg = Message::new(name.clone(), retval.clone(), false);
            msg.add_param(key.clone(), value.clone());
            let line = encode_request(&msg, "id");
            let (status, decoded) = decode_request(&line);
            prop_assert_eq!(status, DECODE_OK);
            let decoded = decoded.expect("decode succeeded");
            prop_assert_eq!(decoded.message.name(), name.as_str());
            prop_assert_eq!(decoded.message.retval(), retval.as_str());
            prop_assert_eq!(decoded.message.get_param(&key), Some(value.as_str()));
        }
    }
}
