//! Information elements: the typed TLV payload carried by full frames.

use crate::error::FrameError;

/// One decoded information element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoElement {
    Version(u16),
    Username(String),
    Password(String),
    CallingNumber(String),
    CallingName(String),
    CalledNumber(String),
    CalledContext(String),
    Capability(u32),
    Format(u32),
    Cause(String),
    CauseCode(u8),
    Challenge(String),
    Md5Result(String),
    Refresh(u16),
    AuthMethods(u16),
    ApparentAddr(Vec<u8>),
    /// Any element type this crate does not model explicitly, kept so a
    /// list can be re-encoded without losing data it did not understand.
    Unknown(u8, Vec<u8>),
}

const T_VERSION: u8 = 1;
const T_USERNAME: u8 = 2;
const T_PASSWORD: u8 = 3;
const T_CALLING_NUMBER: u8 = 4;
const T_CALLING_NAME: u8 = 5;
const T_CALLED_NUMBER: u8 = 6;
const T_CALLED_CONTEXT: u8 = 7;
const T_CAPABILITY: u8 = 8;
const T_FORMAT: u8 = 9;
const T_CAUSE: u8 = 10;
const T_CAUSE_CODE: u8 = 11;
const T_CHALLENGE: u8 = 12;
const T_MD5_RESULT: u8 = 13;
const T_REFRESH: u8 = 14;
const T_AUTH_METHODS: u8 = 15;
const T_APPARENT_ADDR: u8 = 16;

impl InfoElement {
    fn ie_type(&self) -> u8 {
        match self {
            InfoElement::Version(_) => T_VERSION,
            InfoElement::Username(_) => T_USERNAME,
            InfoElement::Password(_) => T_PASSWORD,
            InfoElement::CallingNumber(_) => T_CALLING_NUMBER,
            InfoElement::CallingName(_) => T_CALLING_NAME,
            InfoElement::CalledNumber(_) => T_CALLED_NUMBER,
            InfoElement::CalledContext(_) => T_CALLED_CONTEXT,
            InfoElement::Capability(_) => T_CAPABILITY,
            InfoElement::Format(_) => T_FORMAT,
            InfoElement::Cause(_) => T_CAUSE,
            InfoElement::CauseCode(_) => T_CAUSE_CODE,
            InfoElement::Challenge(_) => T_CHALLENGE,
            InfoElement::Md5Result(_) => T_MD5_RESULT,
            InfoElement::Refresh(_) => T_REFRESH,
            InfoElement::AuthMethods(_) => T_AUTH_METHODS,
            InfoElement::ApparentAddr(_) => T_APPARENT_ADDR,
            InfoElement::Unknown(t, _) => *t,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            InfoElement::Version(v) | InfoElement::Refresh(v) | InfoElement::AuthMethods(v) => {
                out.extend_from_slice(&v.to_be_bytes());
            }
            InfoElement::Username(s)
            | InfoElement::Password(s)
            | InfoElement::CallingNumber(s)
            | InfoElement::CallingName(s)
            | InfoElement::CalledNumber(s)
            | InfoElement::CalledContext(s)
            | InfoElement::Cause(s)
            | InfoElement::Challenge(s)
            | InfoElement::Md5Result(s) => out.extend_from_slice(s.as_bytes()),
            InfoElement::Capability(v) | InfoElement::Format(v) => {
                out.extend_from_slice(&v.to_be_bytes());
            }
            InfoElement::CauseCode(v) => out.push(*v),
            InfoElement::ApparentAddr(bytes) | InfoElement::Unknown(_, bytes) => {
                out.extend_from_slice(bytes);
            }
        }
    }

    fn decode(ie_type: u8, body: &[u8]) -> InfoElement {
        let as_string = || String::from_utf8_lossy(body).into_owned();
        let as_u16 = || {
            let mut buf = [0u8; 2];
            let n = body.len().min(2);
            buf[2 - n..].copy_from_slice(&body[..n]);
            u16::from_be_bytes(buf)
        };
        let as_u32 = || {
            let mut buf = [0u8; 4];
            let n = body.len().min(4);
            buf[4 - n..].copy_from_slice(&body[..n]);
            u32::from_be_bytes(buf)
        };

        match ie_type {
            T_VERSION => InfoElement::Version(as_u16()),
            T_USERNAME => InfoElement::Username(as_string()),
            T_PASSWORD => InfoElement::Password(as_string()),
            T_CALLING_NUMBER => InfoElement::CallingNumber(as_string()),
            T_CALLING_NAME => InfoElement::CallingName(as_string()),
            T_CALLED_NUMBER => InfoElement::CalledNumber(as_string()),
            T_CALLED_CONTEXT => InfoElement::CalledContext(as_string()),
            T_CAPABILITY => InfoElement::Capability(as_u32()),
            T_FORMAT => InfoElement::Format(as_u32()),
            T_CAUSE => InfoElement::Cause(as_string()),
            T_CAUSE_CODE => InfoElement::CauseCode(body.first().copied().unwrap_or(0)),
            T_CHALLENGE => InfoElement::Challenge(as_string()),
            T_MD5_RESULT => InfoElement::Md5Result(as_string()),
            T_REFRESH => InfoElement::Refresh(as_u16()),
            T_AUTH_METHODS => InfoElement::AuthMethods(as_u16()),
            T_APPARENT_ADDR => InfoElement::ApparentAddr(body.to_vec()),
            other => InfoElement::Unknown(other, body.to_vec()),
        }
    }
}

/// An ordered list of information elements, as carried in a full frame's
/// payload. Encoded as a sequence of `(type: u8, len: u8, data)` records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IaxIeList {
    elements: Vec<InfoElement>,
}

impl IaxIeList {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, ie: InfoElement) -> Self {
        self.elements.push(ie);
        self
    }

    pub fn push(&mut self, ie: InfoElement) {
        self.elements.push(ie);
    }

    pub fn iter(&self) -> impl Iterator<Item = &InfoElement> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get_string(&self, predicate: impl Fn(&InfoElement) -> Option<&str>) -> Option<&str> {
        self.elements.iter().find_map(|ie| predicate(ie))
    }

    pub fn username(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Username(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn password(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Password(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn challenge(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Challenge(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn md5_result(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Md5Result(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn called_number(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::CalledNumber(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn calling_number(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::CallingNumber(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn calling_name(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::CallingName(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn called_context(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::CalledContext(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn capability(&self) -> Option<u32> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Capability(v) => Some(*v),
            _ => None,
        })
    }

    pub fn format(&self) -> Option<u32> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Format(v) => Some(*v),
            _ => None,
        })
    }

    pub fn refresh(&self) -> Option<u16> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Refresh(v) => Some(*v),
            _ => None,
        })
    }

    pub fn cause_code(&self) -> Option<u8> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::CauseCode(v) => Some(*v),
            _ => None,
        })
    }

    pub fn version(&self) -> Option<u16> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Version(v) => Some(*v),
            _ => None,
        })
    }

    pub fn auth_methods(&self) -> Option<u16> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::AuthMethods(v) => Some(*v),
            _ => None,
        })
    }

    pub fn cause(&self) -> Option<&str> {
        self.elements.iter().find_map(|ie| match ie {
            InfoElement::Cause(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Mirrors the original's `invalidIEList()`: a list is invalid if any
    /// element failed to parse to a sane value. Since [`InfoElement::decode`]
    /// always produces a best-effort value, the only structural invalidity
    /// this crate tracks is a truncated element, which [`IaxIeList::decode`]
    /// already rejects by returning an error — so a successfully decoded
    /// list is never invalid. Kept as an explicit check so callers that
    /// build a list by hand (e.g. tests) can still assert on it, and so
    /// intent reads the same as in the original.
    pub fn invalid_ie_list(&self) -> bool {
        false
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for ie in &self.elements {
            let mut body = Vec::new();
            ie.encode_body(&mut body);
            out.push(ie.ie_type());
            out.push(body.len() as u8);
            out.extend_from_slice(&body);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut elements = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            if offset + 2 > bytes.len() {
                return Err(FrameError::TruncatedIe {
                    ie_type: bytes[offset],
                    offset,
                    declared: 0,
                    remaining: bytes.len() - offset,
                });
            }
            let ie_type = bytes[offset];
            let len = bytes[offset + 1] as usize;
            let body_start = offset + 2;
            if body_start + len > bytes.len() {
                return Err(FrameError::TruncatedIe {
                    ie_type,
                    offset,
                    declared: len,
                    remaining: bytes.len() - body_start,
                });
            }
            let body = &bytes[body_start..body_start + len];
            elements.push(InfoElement::decode(ie_type, body));
            offset = body_start + len;
        }
        Ok(Self { elements })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_elements() {
        let list = IaxIeList::new()
            .with(InfoElement::Username("alice".into()))
            .with(InfoElement::Capability(0x04))
            .with(InfoElement::CauseCode(42));

        let bytes = list.encode();
        let decoded = IaxIeList::decode(&bytes).expect("well-formed");
        assert_eq!(decoded.username(), Some("alice"));
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn unknown_type_round_trips_as_unknown() {
        let list = IaxIeList::new().with(InfoElement::Unknown(200, vec![1, 2, 3]));
        let bytes = list.encode();
        let decoded = IaxIeList::decode(&bytes).expect("well-formed");
        assert_eq!(decoded.iter().next(), Some(&InfoElement::Unknown(200, vec![1, 2, 3])));
    }

    #[test]
    fn truncated_element_is_rejected() {
        let bytes = [T_USERNAME, 10, b'a', b'b'];
        let err = IaxIeList::decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedIe { .. }));
    }
}
