//! Audio codec bitmask constants used by `format`/`capability` negotiation
//! (spec.md §4.9 "Format/capability negotiation").
//!
//! Bit positions follow the historical IAX2/Asterisk codec bitmap so a
//! capability mask built here reads naturally against other IAX2
//! implementations, though this crate does not claim wire compatibility
//! with them (spec.md §1 Non-goals: "full IAX2 features").

/// G.723.1, 5.3/6.3 kbps.
pub const G723_1: u32 = 1 << 0;
/// GSM full-rate.
pub const GSM: u32 = 1 << 1;
/// G.711 mu-law.
pub const ULAW: u32 = 1 << 2;
/// G.711 A-law.
pub const ALAW: u32 = 1 << 3;
/// 16-bit signed linear PCM.
pub const SLINEAR: u32 = 1 << 4;
/// G.729A.
pub const G729A: u32 = 1 << 9;

/// Fixed precedence order consulted when neither side's preferred format is
/// acceptable to the other (spec.md §4.9 "choose the first audio format in
/// a fixed precedence table whose bit is set in the intersection").
pub const AUDIO_PRECEDENCE: [u32; 5] = [ULAW, ALAW, GSM, SLINEAR, G729A];

/// Whether `format` is one of the audio codecs this crate recognizes.
///
/// A single-bit-set test against the known audio formats; a multi-bit value
/// (a capability mask, not a chosen format) is never itself "an audio
/// format".
pub fn is_audio_format(format: u32) -> bool {
    AUDIO_PRECEDENCE.contains(&format)
}

/// Negotiate the media format for an inbound `New` per spec.md §4.9.
///
/// Returns `None` when no mutually supported audio format exists (caller
/// should reject the call with "no media format").
pub fn negotiate(local_capability: u32, local_preferred: u32, remote_capability: u32, remote_preferred: u32) -> Option<u32> {
    let intersection = local_capability & remote_capability;
    if intersection == 0 {
        return None;
    }
    if intersection & remote_preferred != 0 && is_audio_format(remote_preferred) {
        return Some(remote_preferred);
    }
    if intersection & local_preferred != 0 && is_audio_format(local_preferred) {
        return Some(local_preferred);
    }
    AUDIO_PRECEDENCE.into_iter().find(|candidate| intersection & candidate != 0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;

    #[test]
    fn prefers_remote_format_when_mutually_supported() {
        let capability = ULAW | ALAW | GSM;
        let chosen = negotiate(capability, ALAW, capability, ULAW);
        assert_eq!(chosen, Some(ULAW));
    }

    #[test]
    fn falls_back_to_local_preferred_when_remote_format_unsupported() {
        let local_capability = ULAW | ALAW;
        let remote_capability = ULAW | ALAW | GSM;
        let chosen = negotiate(local_capability, ALAW, remote_capability, GSM);
        assert_eq!(chosen, Some(ALAW));
    }

    #[test]
    fn falls_back_to_precedence_table_when_neither_preferred_is_mutual() {
        let local_capability = GSM | SLINEAR;
        let local_preferred = SLINEAR;
        let remote_capability = GSM | ULAW;
        let remote_preferred = ULAW;
        // Intersection is GSM only; neither side's preferred format survives it.
        let chosen = negotiate(local_capability, local_preferred, remote_capability, remote_preferred);
        assert_eq!(chosen, Some(GSM));
    }

    #[test]
    fn no_common_capability_yields_none() {
        assert_eq!(negotiate(ULAW, ULAW, GSM, GSM), None);
    }
}
