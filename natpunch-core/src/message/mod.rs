/*
   0                   1                   2                   3
   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |0 0|     message type(14)      |        body length(16)        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                      magic cookie(32)                         |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                                               |
  |                     transaction id(96)                        |
  |                                                               |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |    attribute type(16)         |     value length(16)          |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                 value(n), padded to 4 bytes                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::rendezvous::Token;

pub mod attribute;
pub use attribute::Attribute;

pub const HEADER_LEN: usize = 20;
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub mod error_code {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNKNOWN_USER: u16 = 404;
    pub const ALLOCATION_MISMATCH: u16 = 437;
    /// The correlation token is unknown or its waiter already gave up.
    pub const UNKNOWN_CORRELATION: u16 = 447;
    pub const SERVER_ERROR: u16 = 500;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    FailureResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::FailureResponse => 0b11,
        }
    }
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::FailureResponse,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Method {
    /// Reflexive address query
    Binding,
    Allocate,
    Refresh,
    Connect,
    ConnectionBind,
    ConnectionAttempt,
    Register,
    Deregister,
    KeepAlive,
    ConnectRequest,
    Reversal,
    Unknown(u16),
}

impl From<u16> for Method {
    fn from(value: u16) -> Self {
        match value {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x00A => Method::Connect,
            0x00B => Method::ConnectionBind,
            0x00C => Method::ConnectionAttempt,
            0x100 => Method::Register,
            0x101 => Method::Deregister,
            0x102 => Method::KeepAlive,
            0x103 => Method::ConnectRequest,
            0x104 => Method::Reversal,
            v => Method::Unknown(v),
        }
    }
}

impl From<Method> for u16 {
    fn from(method: Method) -> Self {
        match method {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Connect => 0x00A,
            Method::ConnectionBind => 0x00B,
            Method::ConnectionAttempt => 0x00C,
            Method::Register => 0x100,
            Method::Deregister => 0x101,
            Method::KeepAlive => 0x102,
            Method::ConnectRequest => 0x103,
            Method::Reversal => 0x104,
            Method::Unknown(v) => v & 0x0FFF,
        }
    }
}

fn encode_type(method: Method, class: MessageClass) -> u16 {
    let m: u16 = method.into();
    let c = class.bits();
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7)
}

fn decode_type(message_type: u16) -> (Method, MessageClass) {
    let c = ((message_type >> 4) & 0b01) | ((message_type >> 7) & 0b10);
    let m = (message_type & 0x000F) | ((message_type >> 1) & 0x0070) | ((message_type >> 2) & 0x0F80);
    (Method::from(m), MessageClass::from_bits(c))
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        TransactionId(rand::random())
    }
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl From<[u8; 12]> for TransactionId {
    fn from(value: [u8; 12]) -> Self {
        TransactionId(value)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    class: MessageClass,
    method: Method,
    transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(class: MessageClass, method: Method, transaction_id: TransactionId) -> Self {
        Self {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }
    pub fn request(method: Method) -> Self {
        Self::new(MessageClass::Request, method, TransactionId::random())
    }
    pub fn indication(method: Method) -> Self {
        Self::new(MessageClass::Indication, method, TransactionId::random())
    }
    pub fn success_response(request: &Message) -> Self {
        Self::new(
            MessageClass::SuccessResponse,
            request.method,
            request.transaction_id,
        )
    }
    pub fn failure_response(request: &Message, code: u16, reason: &str) -> Self {
        Self::new(
            MessageClass::FailureResponse,
            request.method,
            request.transaction_id,
        )
        .with_attribute(Attribute::ErrorCode {
            code,
            reason: reason.to_string(),
        })
    }
    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }
    #[inline]
    pub fn class(&self) -> MessageClass {
        self.class
    }
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }
    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    pub fn is_request(&self) -> bool {
        self.class == MessageClass::Request
    }
    pub fn is_indication(&self) -> bool {
        self.class == MessageClass::Indication
    }
    pub fn is_success(&self) -> bool {
        self.class == MessageClass::SuccessResponse
    }
    pub fn is_failure(&self) -> bool {
        self.class == MessageClass::FailureResponse
    }
    pub fn is(&self, method: Method, class: MessageClass) -> bool {
        self.method == method && self.class == class
    }

    pub fn xor_mapped_address(&self) -> Option<Endpoint> {
        self.find(|a| match a {
            Attribute::XorMappedAddress(e) => Some(*e),
            _ => None,
        })
    }
    pub fn peer_address(&self) -> Option<Endpoint> {
        self.find(|a| match a {
            Attribute::XorPeerAddress(e) => Some(*e),
            _ => None,
        })
    }
    pub fn relayed_address(&self) -> Option<Endpoint> {
        self.find(|a| match a {
            Attribute::XorRelayedAddress(e) => Some(*e),
            _ => None,
        })
    }
    pub fn private_address(&self) -> Option<Endpoint> {
        self.find(|a| match a {
            Attribute::PrivateAddress(e) => Some(*e),
            _ => None,
        })
    }
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(s) => Some(s.as_str()),
            _ => None,
        })
    }
    pub fn token(&self) -> Option<Token> {
        self.find(|a| match a {
            Attribute::CorrelationToken(t) => Some(*t),
            _ => None,
        })
    }
    pub fn data(&self) -> Option<&Bytes> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(d) => Some(d),
            _ => None,
        })
    }
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }
    fn find<T>(&self, f: impl Fn(&Attribute) -> Option<T>) -> Option<T> {
        self.attributes.iter().find_map(f)
    }

    /// Turn a failure response into [`Error::Rejected`] and check that a
    /// success response answers `method`.
    pub fn into_success(self, method: Method) -> Result<Message> {
        if self.is_failure() {
            let (code, reason) = self
                .error_code()
                .map(|(code, reason)| (code, reason.to_string()))
                .unwrap_or((error_code::SERVER_ERROR, String::new()));
            return Err(Error::Rejected { code, reason });
        }
        if !self.is(method, MessageClass::SuccessResponse) {
            return Err(Error::UnexpectedMessage {
                method: self.method,
                class: self.class,
            });
        }
        Ok(self)
    }

    /// Fails when an attribute or the whole body does not fit the 16-bit
    /// length fields.
    pub fn encode(&self) -> Result<BytesMut> {
        let mut body = BytesMut::new();
        for attribute in &self.attributes {
            attribute.encode(&self.transaction_id, &mut body)?;
        }
        let len = u16::try_from(body.len())
            .map_err(|_| Error::InvalidMessage(format!("body of {} bytes", body.len())))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u16(encode_type(self.method, self.class));
        buf.put_u16(len);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Body length announced by a header, validated before the body is read.
    pub fn body_len(header: &[u8]) -> Result<usize> {
        if header.len() < HEADER_LEN {
            return Err(Error::InvalidMessage(format!(
                "header of {} bytes",
                header.len()
            )));
        }
        if header[0] & 0xC0 != 0 {
            return Err(Error::InvalidMessage("leading bits set".into()));
        }
        let cookie = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::InvalidMessage(format!("magic cookie {cookie:#x}")));
        }
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if len % 4 != 0 {
            return Err(Error::InvalidMessage(format!("unaligned body length {len}")));
        }
        Ok(len)
    }

    pub fn decode(buf: &[u8]) -> Result<Message> {
        let len = Self::body_len(buf)?;
        if buf.len() < HEADER_LEN + len {
            return Err(Error::InvalidMessage(format!(
                "truncated: {} of {} bytes",
                buf.len(),
                HEADER_LEN + len
            )));
        }
        let (method, class) = decode_type(u16::from_be_bytes([buf[0], buf[1]]));
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..HEADER_LEN]);
        let transaction_id = TransactionId(transaction_id);
        let mut body = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + len]);
        let mut attributes = Vec::new();
        while body.has_remaining() {
            if body.remaining() < 4 {
                return Err(Error::InvalidMessage("dangling attribute header".into()));
            }
            let kind = body.get_u16();
            let value_len = body.get_u16() as usize;
            let padded = value_len + (4 - value_len % 4) % 4;
            if body.remaining() < padded {
                return Err(Error::InvalidMessage(format!(
                    "attribute {kind:#06x} overruns body"
                )));
            }
            let value = body.split_to(value_len);
            body.advance(padded - value_len);
            attributes.push(Attribute::decode(kind, value, &transaction_id)?);
        }
        Ok(Message {
            class,
            method,
            transaction_id,
            attributes,
        })
    }
}
