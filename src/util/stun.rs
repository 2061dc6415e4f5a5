//! Minimal STUN Binding client codec (RFC 5389)
//!
//! Only what server-reflexive gathering needs: encode a Binding request and
//! pull the mapped address out of a Binding success response.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

/// STUN magic cookie value (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_LEN: usize = 20;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

pub type TransactionId = [u8; 12];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StunError {
    #[error("not a STUN message")]
    NotStun,
    #[error("unexpected STUN message type {0:#06x}")]
    UnexpectedType(u16),
    #[error("truncated STUN message")]
    Truncated,
    #[error("unknown address family {0}")]
    AddressFamily(u8),
    #[error("binding response carries no mapped address")]
    NoMappedAddress,
}

/// A fresh Binding request and its transaction id.
pub fn binding_request() -> (TransactionId, Bytes) {
    let tid: TransactionId = rand::thread_rng().gen();
    (tid, encode_binding_request(&tid))
}

pub fn encode_binding_request(tid: &TransactionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(tid);
    buf.freeze()
}

/// Cheap check whether a datagram looks like STUN at all.
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xC0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

/// Transaction id of any STUN message.
pub fn transaction_id(buf: &[u8]) -> Option<TransactionId> {
    if !is_stun(buf) {
        return None;
    }
    buf[8..HEADER_LEN].try_into().ok()
}

/// Decodes a Binding success response into its transaction id and the
/// reflexive address. XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS.
pub fn decode_binding_response(buf: &[u8]) -> Result<(TransactionId, SocketAddr), StunError> {
    let tid = transaction_id(buf).ok_or(StunError::NotStun)?;

    let mut header = &buf[..HEADER_LEN];
    let kind = header.get_u16();
    if kind != BINDING_SUCCESS {
        return Err(StunError::UnexpectedType(kind));
    }
    let len = header.get_u16() as usize;
    if buf.len() < HEADER_LEN + len {
        return Err(StunError::Truncated);
    }

    let mut attrs = &buf[HEADER_LEN..HEADER_LEN + len];
    let mut mapped = None;

    while attrs.remaining() >= 4 {
        let attr = attrs.get_u16();
        let attr_len = attrs.get_u16() as usize;
        let padded = (attr_len + 3) & !3;
        if attrs.remaining() < attr_len {
            return Err(StunError::Truncated);
        }
        let value = &attrs[..attr_len];

        match attr {
            ATTR_XOR_MAPPED_ADDRESS => return Ok((tid, decode_address(value, Some(&tid))?)),
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            _ => {}
        }

        attrs.advance(padded.min(attrs.remaining()));
    }

    mapped.map(|a| (tid, a)).ok_or(StunError::NoMappedAddress)
}

fn decode_address(mut value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Truncated);
    }
    value.advance(1);
    let family = value.get_u8();
    let mut port = value.get_u16();
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        1 => {
            if value.len() < 4 {
                return Err(StunError::Truncated);
            }
            let mut raw = value.get_u32();
            if xor.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        2 => {
            if value.len() < 16 {
                return Err(StunError::Truncated);
            }
            let mut raw = [0u8; 16];
            value.copy_to_slice(&mut raw);
            if let Some(tid) = xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(tid);
                for (b, k) in raw.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        other => return Err(StunError::AddressFamily(other)),
    };

    Ok(SocketAddr::new(ip, port))
}
