//! STUN NAT discovery (RFC 5389 Binding only).
//!
//! Best effort: a Binding Request goes to each configured server in turn and
//! the first XOR-MAPPED-ADDRESS that comes back is our public address.
//! Failures are logged and never affect an ongoing call.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use rand::RngCore;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;

/// STUN magic cookie (RFC 5389).
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

/// STUN message types used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StunMessageType {
    /// Binding Request (0x0001)
    BindingRequest = 0x0001,
    /// Binding Response Success (0x0101)
    BindingResponse = 0x0101,
    /// Binding Error Response (0x0111)
    BindingErrorResponse = 0x0111,
}

impl TryFrom<u16> for StunMessageType {
    type Error = StunError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::BindingRequest),
            0x0101 => Ok(Self::BindingResponse),
            0x0111 => Ok(Self::BindingErrorResponse),
            _ => Err(StunError::InvalidMessageType(value)),
        }
    }
}

/// Attribute types we understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StunAttributeType {
    MappedAddress = 0x0001,
    ErrorCode = 0x0009,
    XorMappedAddress = 0x0020,
}

impl TryFrom<u16> for StunAttributeType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::MappedAddress),
            0x0009 => Ok(Self::ErrorCode),
            0x0020 => Ok(Self::XorMappedAddress),
            _ => Err(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    ErrorCode { code: u16, reason: String },
    Unknown { attr_type: u16, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct StunMessage {
    pub msg_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a Binding Request with the given transaction ID.
    pub fn binding_request(transaction_id: [u8; 12]) -> Self {
        Self {
            msg_type: StunMessageType::BindingRequest,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Encode to wire format. Only attribute-less requests are ever sent.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        buf
    }

    /// Parse a STUN message from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_LEN {
            return Err(StunError::TooShort(data.len()));
        }

        let msg_type = StunMessageType::try_from(u16::from_be_bytes([data[0], data[1]]))?;
        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;

        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != STUN_MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(cookie));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..HEADER_LEN]);

        if data.len() < HEADER_LEN + msg_len {
            return Err(StunError::TooShort(data.len()));
        }

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        let end = HEADER_LEN + msg_len;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_len > end {
                return Err(StunError::InvalidAttribute);
            }
            let attr_data = &data[offset..offset + attr_len];

            let attr = match StunAttributeType::try_from(attr_type) {
                Ok(StunAttributeType::MappedAddress) => StunAttribute::MappedAddress(
                    parse_address(attr_data, false, &transaction_id)?,
                ),
                Ok(StunAttributeType::XorMappedAddress) => StunAttribute::XorMappedAddress(
                    parse_address(attr_data, true, &transaction_id)?,
                ),
                Ok(StunAttributeType::ErrorCode) => parse_error_code(attr_data)?,
                Err(_) => StunAttribute::Unknown {
                    attr_type,
                    data: attr_data.to_vec(),
                },
            };
            attributes.push(attr);

            // Attributes are padded to a 4-byte boundary.
            offset += attr_len.div_ceil(4) * 4;
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }

    /// Our reflexive address, preferring XOR-MAPPED-ADDRESS.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let xored = self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });
        xored.or_else(|| {
            self.attributes.iter().find_map(|a| match a {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }
}

/// Parse MAPPED-ADDRESS or XOR-MAPPED-ADDRESS.
fn parse_address(
    data: &[u8],
    xored: bool,
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, StunError> {
    if data.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xored {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();

    let ip = match family {
        0x01 => {
            if data.len() < 8 {
                return Err(StunError::InvalidAttribute);
            }
            let mut octets = [data[4], data[5], data[6], data[7]];
            if xored {
                for (o, c) in octets.iter_mut().zip(cookie) {
                    *o ^= c;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            if data.len() < 20 {
                return Err(StunError::InvalidAttribute);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if xored {
                let mask = cookie.iter().chain(transaction_id.iter());
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };

    Ok(SocketAddr::new(ip, port))
}

fn parse_error_code(data: &[u8]) -> Result<StunAttribute, StunError> {
    if data.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let class = data[2] & 0x07;
    let number = data[3];
    let code = (class as u16) * 100 + (number as u16);
    let reason = String::from_utf8_lossy(&data[4..]).to_string();
    Ok(StunAttribute::ErrorCode { code, reason })
}

/// Errors during STUN operations.
#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("STUN message too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid STUN message type: 0x{0:04x}")]
    InvalidMessageType(u16),
    #[error("Invalid STUN magic cookie: 0x{0:08x}")]
    InvalidMagicCookie(u32),
    #[error("Invalid STUN attribute")]
    InvalidAttribute,
    #[error("STUN error response: {0} - {1}")]
    ServerError(u16, String),
    #[error("Transaction ID mismatch")]
    TransactionMismatch,
    #[error("No mapped address in response")]
    NoMappedAddress,
    #[error("No STUN server answered")]
    NoServers,
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("Timeout waiting for STUN response")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct StunConfig {
    /// `host:port` of each server, tried in order.
    pub servers: Vec<String>,
    /// Per-server response timeout.
    pub timeout: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            timeout: Duration::from_millis(1500),
        }
    }
}

/// Public address discovery client.
pub struct StunClient {
    config: StunConfig,
}

impl StunClient {
    pub fn new(config: StunConfig) -> Self {
        Self { config }
    }

    fn generate_transaction_id() -> [u8; 12] {
        let mut id = [0u8; 12];
        rand::rng().fill_bytes(&mut id);
        id
    }

    /// Try each server until one reports our mapped address.
    pub async fn discover(&self) -> Result<SocketAddr, StunError> {
        for server in &self.config.servers {
            match self.query(server).await {
                Ok(addr) => {
                    debug!("STUN: {server} reports public address {addr}");
                    return Ok(addr);
                }
                Err(e) => warn!("STUN: {server} failed: {e}"),
            }
        }
        Err(StunError::NoServers)
    }

    async fn query(&self, server: &str) -> Result<SocketAddr, StunError> {
        let target = lookup_host(server)
            .await?
            .next()
            .ok_or(StunError::NoServers)?;
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        self.query_socket(&socket).await
    }

    /// Run one Binding transaction over an already connected socket.
    pub async fn query_socket(&self, socket: &UdpSocket) -> Result<SocketAddr, StunError> {
        let transaction_id = Self::generate_transaction_id();
        socket
            .send(&StunMessage::binding_request(transaction_id).encode())
            .await?;

        let mut buf = [0u8; 1024];
        let len = match timeout(self.config.timeout, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(StunError::Timeout),
        };

        let response = StunMessage::decode(&buf[..len])?;
        if response.transaction_id != transaction_id {
            return Err(StunError::TransactionMismatch);
        }
        if response.msg_type == StunMessageType::BindingErrorResponse {
            let (code, reason) = response.error_code().unwrap_or((0, "Unknown error"));
            return Err(StunError::ServerError(code, reason.to_string()));
        }
        response.mapped_address().ok_or(StunError::NoMappedAddress)
    }
}
