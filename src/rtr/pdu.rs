//! RTR PDUs.
//!
//! This module contains a pure, allocation-light codec for the wire
//! representation of RPKI-RTR protocol data units (RFC 6810 / RFC 8210).
//! It performs no I/O: [`Pdu::decode`] consumes bytes from a [`BytesMut`]
//! buffer and [`Pdu::encode`] appends bytes to one. Framing is always
//! `{version: u8, pdu_type: u8, session_or_zero: u16, length: u32}`
//! followed by a type-specific body, `length` always counting the full
//! PDU including this header.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use super::serial::Serial;
use crate::vrp::{Prefix, Vrp};

/// Size of the common PDU header.
const HEADER_LEN: usize = 8;

pub const PDU_SERIAL_NOTIFY: u8 = 0;
pub const PDU_SERIAL_QUERY: u8 = 1;
pub const PDU_RESET_QUERY: u8 = 2;
pub const PDU_CACHE_RESPONSE: u8 = 3;
pub const PDU_IPV4_PREFIX: u8 = 4;
pub const PDU_IPV6_PREFIX: u8 = 6;
pub const PDU_END_OF_DATA: u8 = 7;
pub const PDU_CACHE_RESET: u8 = 8;
pub const PDU_ERROR_REPORT: u8 = 10;


//------------ Timing ----------------------------------------------------------

/// The v1 `End of Data` timer fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timing {
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
}


//------------ Pdu --------------------------------------------------------------

/// A decoded or to-be-encoded RTR protocol data unit.
#[derive(Clone, Debug)]
pub enum Pdu {
    SerialNotify { version: u8, session: u16, serial: Serial },
    SerialQuery { version: u8, session: u16, serial: Serial },
    ResetQuery { version: u8 },
    CacheResponse { version: u8, session: u16 },
    Prefix { version: u8, flags: u8, vrp: Vrp },
    EndOfData { version: u8, session: u16, serial: Serial, timing: Option<Timing> },
    CacheReset { version: u8 },
    ErrorReport { version: u8, error_code: u16, pdu: Vec<u8>, text: String },
}

impl Pdu {
    pub fn version(&self) -> u8 {
        match self {
            Pdu::SerialNotify { version, .. }
            | Pdu::SerialQuery { version, .. }
            | Pdu::ResetQuery { version }
            | Pdu::CacheResponse { version, .. }
            | Pdu::Prefix { version, .. }
            | Pdu::EndOfData { version, .. }
            | Pdu::CacheReset { version }
            | Pdu::ErrorReport { version, .. } => *version,
        }
    }

    /// Announcement flag value for a [`Pdu::Prefix`].
    pub const FLAG_ANNOUNCE: u8 = 1;
    pub const FLAG_WITHDRAW: u8 = 0;

    /// Encodes this PDU onto the end of `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Pdu::SerialNotify { version, session, serial } => {
                encode_header(buf, *version, PDU_SERIAL_NOTIFY, *session, 12);
                buf.put_u32(serial.0);
            }
            Pdu::SerialQuery { version, session, serial } => {
                encode_header(buf, *version, PDU_SERIAL_QUERY, *session, 12);
                buf.put_u32(serial.0);
            }
            Pdu::ResetQuery { version } => {
                encode_header(buf, *version, PDU_RESET_QUERY, 0, 8);
            }
            Pdu::CacheResponse { version, session } => {
                encode_header(buf, *version, PDU_CACHE_RESPONSE, *session, 8);
            }
            Pdu::Prefix { version, flags, vrp } => encode_prefix(buf, *version, *flags, vrp),
            Pdu::EndOfData { version, session, serial, timing } => {
                if *version == 0 {
                    encode_header(buf, *version, PDU_END_OF_DATA, *session, 12);
                    buf.put_u32(serial.0);
                } else {
                    let timing = timing.unwrap_or_default();
                    encode_header(buf, *version, PDU_END_OF_DATA, *session, 24);
                    buf.put_u32(serial.0);
                    buf.put_u32(timing.refresh);
                    buf.put_u32(timing.retry);
                    buf.put_u32(timing.expire);
                }
            }
            Pdu::CacheReset { version } => {
                encode_header(buf, *version, PDU_CACHE_RESET, 0, 8);
            }
            Pdu::ErrorReport { version, error_code, pdu, text } => {
                let text_bytes = text.as_bytes();
                let len = HEADER_LEN + 4 + pdu.len() + 4 + text_bytes.len();
                encode_header(buf, *version, PDU_ERROR_REPORT, *error_code, len as u32);
                buf.put_u32(pdu.len() as u32);
                buf.put_slice(pdu);
                buf.put_u32(text_bytes.len() as u32);
                buf.put_slice(text_bytes);
            }
        }
    }

    /// Tries to decode one PDU from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete PDU — the
    /// caller should read more bytes and try again without consuming
    /// anything. On success, the consumed bytes are advanced out of `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Pdu>, PduError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let version = buf[0];
        let pdu_type = buf[1];
        let session = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if length < HEADER_LEN {
            return Err(PduError::corrupt(version, "PDU length smaller than header"));
        }
        if buf.len() < length {
            return Ok(None);
        }

        let pdu = match pdu_type {
            PDU_SERIAL_NOTIFY => {
                check_length(version, length, 12)?;
                let serial = Serial::from_be(read_u32(buf, 8));
                Pdu::SerialNotify { version, session, serial }
            }
            PDU_SERIAL_QUERY => {
                check_length(version, length, 12)?;
                let serial = Serial::from_be(read_u32(buf, 8));
                Pdu::SerialQuery { version, session, serial }
            }
            PDU_RESET_QUERY => {
                check_length(version, length, 8)?;
                Pdu::ResetQuery { version }
            }
            PDU_CACHE_RESPONSE => {
                check_length(version, length, 8)?;
                Pdu::CacheResponse { version, session }
            }
            PDU_IPV4_PREFIX => {
                check_length(version, length, 20)?;
                decode_v4_prefix(version, buf)?
            }
            PDU_IPV6_PREFIX => {
                check_length(version, length, 32)?;
                decode_v6_prefix(version, buf)?
            }
            PDU_END_OF_DATA => {
                if version == 0 {
                    check_length(version, length, 12)?;
                    let serial = Serial::from_be(read_u32(buf, 8));
                    Pdu::EndOfData { version, session, serial, timing: None }
                } else {
                    check_length(version, length, 24)?;
                    let serial = Serial::from_be(read_u32(buf, 8));
                    let timing = Timing {
                        refresh: read_u32(buf, 12),
                        retry: read_u32(buf, 16),
                        expire: read_u32(buf, 20),
                    };
                    Pdu::EndOfData { version, session, serial, timing: Some(timing) }
                }
            }
            PDU_CACHE_RESET => {
                check_length(version, length, 8)?;
                Pdu::CacheReset { version }
            }
            PDU_ERROR_REPORT => decode_error_report(version, session, length, buf)?,
            other => {
                buf.advance(length);
                return Err(PduError::unsupported(version, other));
            }
        };
        buf.advance(length);
        Ok(Some(pdu))
    }
}

fn encode_header(buf: &mut BytesMut, version: u8, pdu_type: u8, session: u16, length: u32) {
    buf.put_u8(version);
    buf.put_u8(pdu_type);
    buf.put_u16(session);
    buf.put_u32(length);
}

fn encode_prefix(buf: &mut BytesMut, version: u8, flags: u8, vrp: &Vrp) {
    match vrp.prefix {
        Prefix::V4(addr, len) => {
            encode_header(buf, version, PDU_IPV4_PREFIX, 0, 20);
            buf.put_u8(flags);
            buf.put_u8(len);
            buf.put_u8(vrp.max_length);
            buf.put_u8(0);
            buf.put_slice(&addr.octets());
            buf.put_u32(vrp.asn);
        }
        Prefix::V6(addr, len) => {
            encode_header(buf, version, PDU_IPV6_PREFIX, 0, 32);
            buf.put_u8(flags);
            buf.put_u8(len);
            buf.put_u8(vrp.max_length);
            buf.put_u8(0);
            buf.put_slice(&addr.octets());
            buf.put_u32(vrp.asn);
        }
    }
}

fn decode_v4_prefix(version: u8, buf: &BytesMut) -> Result<Pdu, PduError> {
    let flags = buf[8];
    let prefix_len = buf[9];
    let max_len = buf[10];
    let addr = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let asn = read_u32(buf, 16);
    let vrp = Vrp::new(Prefix::V4(addr, prefix_len), asn, max_len)
        .ok_or_else(|| PduError::corrupt(version, "invalid IPv4 prefix PDU"))?;
    Ok(Pdu::Prefix { version, flags, vrp })
}

fn decode_v6_prefix(version: u8, buf: &BytesMut) -> Result<Pdu, PduError> {
    let flags = buf[8];
    let prefix_len = buf[9];
    let max_len = buf[10];
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[12..28]);
    let addr = Ipv6Addr::from(octets);
    let asn = read_u32(buf, 28);
    let vrp = Vrp::new(Prefix::V6(addr, prefix_len), asn, max_len)
        .ok_or_else(|| PduError::corrupt(version, "invalid IPv6 prefix PDU"))?;
    Ok(Pdu::Prefix { version, flags, vrp })
}

fn decode_error_report(
    version: u8,
    error_code: u16,
    length: usize,
    buf: &BytesMut,
) -> Result<Pdu, PduError> {
    if length < HEADER_LEN + 4 {
        return Err(PduError::corrupt(version, "truncated error report"));
    }
    let pdu_len = read_u32(buf, 8) as usize;
    let pdu_start = 12;
    let pdu_end = pdu_start
        .checked_add(pdu_len)
        .filter(|end| *end + 4 <= length)
        .ok_or_else(|| PduError::corrupt(version, "truncated error report"))?;
    let pdu = buf[pdu_start..pdu_end].to_vec();
    let text_len = read_u32(buf, pdu_end) as usize;
    let text_start = pdu_end + 4;
    let text_end = text_start
        .checked_add(text_len)
        .filter(|end| *end == length)
        .ok_or_else(|| PduError::corrupt(version, "truncated error report"))?;
    let text = String::from_utf8_lossy(&buf[text_start..text_end]).into_owned();
    Ok(Pdu::ErrorReport { version, error_code, pdu, text })
}

fn read_u32(buf: &BytesMut, at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn check_length(version: u8, got: usize, expected: u32) -> Result<(), PduError> {
    if got as u32 != expected {
        Err(PduError::corrupt(version, "invalid PDU length"))
    } else {
        Ok(())
    }
}


//------------ PduError --------------------------------------------------------

/// The three error codes the session FSM needs to react to, wrapped with
/// enough context to build an Error Report PDU.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{text} (code {code})")]
pub struct PduError {
    pub version: u8,
    pub code: u16,
    pub text: &'static str,
}

impl PduError {
    pub fn unsupported(version: u8, _pdu_type: u8) -> Self {
        PduError { version, code: 3, text: "Unsupported PDU Type" }
    }

    pub fn corrupt(version: u8, text: &'static str) -> Self {
        PduError { version, code: 0, text }
    }

    pub fn bad_version(version: u8) -> Self {
        PduError { version, code: 8, text: "Unexpected Protocol Version" }
    }

    pub fn no_data(version: u8) -> Self {
        PduError { version, code: 2, text: "No Data Available" }
    }

    pub fn to_pdu(&self) -> Pdu {
        Pdu::ErrorReport {
            version: self.version,
            error_code: self.code,
            pdu: Vec::new(),
            text: self.text.to_string(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn v4_vrp() -> Vrp {
        Vrp::new(Prefix::from_str("10.0.0.0/24").unwrap(), 64496, 24).unwrap()
    }

    fn v6_vrp() -> Vrp {
        Vrp::new(Prefix::from_str("2001:db8::/32").unwrap(), 64497, 48).unwrap()
    }

    fn roundtrip(pdu: Pdu) -> Pdu {
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        let expected_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(expected_len as usize, buf.len());
        let decoded = Pdu::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn serial_notify_roundtrips() {
        match roundtrip(Pdu::SerialNotify { version: 1, session: 7, serial: Serial(42) }) {
            Pdu::SerialNotify { version, session, serial } => {
                assert_eq!(version, 1);
                assert_eq!(session, 7);
                assert_eq!(serial, Serial(42));
            }
            other => panic!("wrong PDU decoded: {:?}", other),
        }
    }

    #[test]
    fn v4_prefix_roundtrips() {
        let vrp = v4_vrp();
        match roundtrip(Pdu::Prefix { version: 0, flags: Pdu::FLAG_ANNOUNCE, vrp }) {
            Pdu::Prefix { flags, vrp: decoded, .. } => {
                assert_eq!(flags, Pdu::FLAG_ANNOUNCE);
                assert_eq!(decoded, vrp);
            }
            other => panic!("wrong PDU decoded: {:?}", other),
        }
    }

    #[test]
    fn v6_prefix_roundtrips() {
        let vrp = v6_vrp();
        match roundtrip(Pdu::Prefix { version: 1, flags: Pdu::FLAG_WITHDRAW, vrp }) {
            Pdu::Prefix { flags, vrp: decoded, .. } => {
                assert_eq!(flags, Pdu::FLAG_WITHDRAW);
                assert_eq!(decoded, vrp);
            }
            other => panic!("wrong PDU decoded: {:?}", other),
        }
    }

    #[test]
    fn end_of_data_v0_has_no_timers() {
        let pdu = Pdu::EndOfData { version: 0, session: 1, serial: Serial(3), timing: None };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn end_of_data_v1_carries_timers() {
        let timing = Timing { refresh: 3600, retry: 600, expire: 7200 };
        let pdu = Pdu::EndOfData {
            version: 1, session: 1, serial: Serial(3), timing: Some(timing),
        };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(buf.len(), 24);
        match roundtrip(pdu) {
            Pdu::EndOfData { timing: Some(t), .. } => {
                assert_eq!(t.refresh, 3600);
                assert_eq!(t.retry, 600);
                assert_eq!(t.expire, 7200);
            }
            other => panic!("wrong PDU decoded: {:?}", other),
        }
    }

    #[test]
    fn decode_returns_none_on_partial_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 2, 0, 0]); // header truncated
        assert!(Pdu::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4); // nothing consumed
    }

    #[test]
    fn unknown_type_is_unsupported_error() {
        let mut buf = BytesMut::new();
        encode_header(&mut buf, 0, 200, 0, 8);
        let err = Pdu::decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 3);
    }

    #[test]
    fn bad_length_is_corrupt_data() {
        let mut buf = BytesMut::new();
        encode_header(&mut buf, 0, PDU_RESET_QUERY, 0, 9); // 9 is invalid
        buf.put_u8(0);
        let err = Pdu::decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 0);
    }

    #[test]
    fn error_report_roundtrips() {
        let pdu = Pdu::ErrorReport {
            version: 0,
            error_code: 4,
            pdu: vec![1, 2, 3, 4],
            text: "only versions 0 and 1 supported".to_string(),
        };
        match roundtrip(pdu) {
            Pdu::ErrorReport { error_code, pdu, text, .. } => {
                assert_eq!(error_code, 4);
                assert_eq!(pdu, vec![1, 2, 3, 4]);
                assert_eq!(text, "only versions 0 and 1 supported");
            }
            other => panic!("wrong PDU decoded: {:?}", other),
        }
    }
}
