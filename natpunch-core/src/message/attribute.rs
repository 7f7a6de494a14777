use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{TransactionId, MAGIC_COOKIE};
use crate::rendezvous::Token;

pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const XOR_PEER_ADDRESS: u16 = 0x0012;
pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const USERNAME: u16 = 0x0006;
pub const ERROR_CODE: u16 = 0x0009;
pub const DATA: u16 = 0x0013;
pub const SOFTWARE: u16 = 0x8022;
pub const PRIVATE_ADDRESS: u16 = 0x8040;
pub const CORRELATION_TOKEN: u16 = 0x8041;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    /// Address of the sender as observed by the receiver.
    XorMappedAddress(Endpoint),
    XorPeerAddress(Endpoint),
    XorRelayedAddress(Endpoint),
    /// Address of the sender as seen by itself, possibly behind a NAT.
    PrivateAddress(Endpoint),
    Username(String),
    CorrelationToken(Token),
    Data(Bytes),
    ErrorCode { code: u16, reason: String },
    Software(String),
    Unknown { kind: u16, value: Bytes },
}

impl Attribute {
    pub fn kind(&self) -> u16 {
        match self {
            Attribute::XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Attribute::XorPeerAddress(_) => XOR_PEER_ADDRESS,
            Attribute::XorRelayedAddress(_) => XOR_RELAYED_ADDRESS,
            Attribute::PrivateAddress(_) => PRIVATE_ADDRESS,
            Attribute::Username(_) => USERNAME,
            Attribute::CorrelationToken(_) => CORRELATION_TOKEN,
            Attribute::Data(_) => DATA,
            Attribute::ErrorCode { .. } => ERROR_CODE,
            Attribute::Software(_) => SOFTWARE,
            Attribute::Unknown { kind, .. } => *kind,
        }
    }

    pub(crate) fn encode(&self, transaction_id: &TransactionId, buf: &mut BytesMut) -> Result<()> {
        let mut value = BytesMut::new();
        match self {
            Attribute::XorMappedAddress(endpoint)
            | Attribute::XorPeerAddress(endpoint)
            | Attribute::XorRelayedAddress(endpoint)
            | Attribute::PrivateAddress(endpoint) => {
                encode_xor_address(endpoint, transaction_id, &mut value)
            }
            Attribute::Username(s) | Attribute::Software(s) => value.put_slice(s.as_bytes()),
            Attribute::CorrelationToken(token) => value.put_u64(token.as_u64()),
            Attribute::Data(data) => value.put_slice(data),
            Attribute::ErrorCode { code, reason } => {
                value.put_u16(0);
                value.put_u8((code / 100) as u8);
                value.put_u8((code % 100) as u8);
                value.put_slice(reason.as_bytes());
            }
            Attribute::Unknown { value: raw, .. } => value.put_slice(raw),
        }
        let len = u16::try_from(value.len()).map_err(|_| {
            Error::InvalidMessage(format!(
                "attribute {:#06x} of {} bytes",
                self.kind(),
                value.len()
            ))
        })?;
        buf.put_u16(self.kind());
        buf.put_u16(len);
        buf.put_slice(&value);
        let padding = (4 - value.len() % 4) % 4;
        buf.put_bytes(0, padding);
        Ok(())
    }

    pub(crate) fn decode(
        kind: u16,
        mut value: Bytes,
        transaction_id: &TransactionId,
    ) -> Result<Attribute> {
        let attribute = match kind {
            XOR_MAPPED_ADDRESS => {
                Attribute::XorMappedAddress(decode_xor_address(&value, transaction_id)?)
            }
            XOR_PEER_ADDRESS => {
                Attribute::XorPeerAddress(decode_xor_address(&value, transaction_id)?)
            }
            XOR_RELAYED_ADDRESS => {
                Attribute::XorRelayedAddress(decode_xor_address(&value, transaction_id)?)
            }
            PRIVATE_ADDRESS => {
                Attribute::PrivateAddress(decode_xor_address(&value, transaction_id)?)
            }
            USERNAME => Attribute::Username(utf8(value)?),
            SOFTWARE => Attribute::Software(utf8(value)?),
            CORRELATION_TOKEN => {
                if value.len() != 8 {
                    return Err(Error::InvalidMessage(format!(
                        "correlation token of {} bytes",
                        value.len()
                    )));
                }
                Attribute::CorrelationToken(Token::from(value.get_u64()))
            }
            DATA => Attribute::Data(value),
            ERROR_CODE => {
                if value.len() < 4 {
                    return Err(Error::InvalidMessage("short error code".into()));
                }
                value.advance(2);
                let class = (value.get_u8() & 0x07) as u16;
                let number = value.get_u8() as u16;
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(Error::InvalidMessage(format!(
                        "error code {class}{number:02} out of range"
                    )));
                }
                Attribute::ErrorCode {
                    code: class * 100 + number,
                    reason: utf8(value)?,
                }
            }
            kind => Attribute::Unknown { kind, value },
        };
        Ok(attribute)
    }
}

fn utf8(value: Bytes) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|e| Error::InvalidMessage(e.to_string()))
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id.as_bytes());
    key
}

fn encode_xor_address(endpoint: &Endpoint, transaction_id: &TransactionId, buf: &mut BytesMut) {
    let key = xor_key(transaction_id);
    buf.put_u8(0);
    let family = if endpoint.is_ipv4() {
        FAMILY_V4
    } else {
        FAMILY_V6
    };
    buf.put_u8(family);
    buf.put_u16(endpoint.port() ^ (MAGIC_COOKIE >> 16) as u16);
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            for (i, b) in ip.octets().iter().enumerate() {
                buf.put_u8(b ^ key[i]);
            }
        }
        IpAddr::V6(ip) => {
            for (i, b) in ip.octets().iter().enumerate() {
                buf.put_u8(b ^ key[i]);
            }
        }
    }
}

fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Result<Endpoint> {
    let key = xor_key(transaction_id);
    if value.len() < 4 {
        return Err(Error::InvalidMessage("short address".into()));
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match (value[1], value.len()) {
        (FAMILY_V4, 8) => {
            let mut octets = [0u8; 4];
            for (i, b) in octets.iter_mut().enumerate() {
                *b = value[4 + i] ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (FAMILY_V6, 20) => {
            let mut octets = [0u8; 16];
            for (i, b) in octets.iter_mut().enumerate() {
                *b = value[4 + i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        (family, len) => {
            return Err(Error::InvalidMessage(format!(
                "address family {family} with {len} bytes"
            )))
        }
    };
    Ok(Endpoint::new(ip, port))
}
