//! Wire-protocol message types, payload codecs, and the 24-byte envelope.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use spvd_consensus::constants::{
    MAX_ADDR_PER_MSG, MAX_HEADERS_PER_MSG, MAX_INV_PER_MSG, MAX_LOCATOR_HASHES,
};
use spvd_consensus::Hash256;
use spvd_primitives::block::{Block, BlockHeader};
use spvd_primitives::encoding::{DecodeError, Decoder, Encoder};
use spvd_primitives::hash::sha256d;

/// Envelope size: magic, command, payload length, checksum prefix.
pub const ENVELOPE_SIZE: usize = 24;
/// Upper bound on a single payload.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

#[derive(Debug)]
pub enum WireError {
    Decode(DecodeError),
    BadMagic,
    BadChecksum,
    CommandTooLong,
    OversizedPayload(usize),
    CountExceeded(&'static str),
    TrailingBytes(&'static str),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Decode(err) => write!(f, "{err}"),
            WireError::BadMagic => write!(f, "envelope magic does not match network"),
            WireError::BadChecksum => write!(f, "payload checksum mismatch"),
            WireError::CommandTooLong => write!(f, "command exceeds 12 bytes"),
            WireError::OversizedPayload(len) => write!(f, "payload of {len} bytes too large"),
            WireError::CountExceeded(what) => write!(f, "{what} count exceeds protocol limit"),
            WireError::TrailingBytes(command) => {
                write!(f, "trailing bytes after {command} payload")
            }
        }
    }
}

impl std::error::Error for WireError {}

impl From<DecodeError> for WireError {
    fn from(err: DecodeError) -> Self {
        WireError::Decode(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetAddress {
    pub timestamp: u32,
    pub services: u64,
    pub addr: SocketAddr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CFHeadersMessage {
    pub extended: bool,
    pub stop_hash: Hash256,
    pub prev_filter_header: Hash256,
    pub filter_hashes: Vec<Hash256>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CFilterMessage {
    pub extended: bool,
    pub block_hash: Hash256,
    pub filter: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    NotFound(Vec<InventoryVector>),
    GetHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Headers(Vec<BlockHeader>),
    GetCFHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
        extended: bool,
    },
    CFHeaders(CFHeadersMessage),
    GetCFilter {
        block_hash: Hash256,
        extended: bool,
    },
    CFilter(CFilterMessage),
    Block(Block),
    Tx(Vec<u8>),
    FeeFilter(i64),
    SendHeaders,
    Reject(RejectMessage),
    /// A command this client does not understand; kept for logging.
    Unknown(String),
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetCFHeaders { .. } => "getcfheaders",
            Message::CFHeaders(_) => "cfheaders",
            Message::GetCFilter { .. } => "getcfilter",
            Message::CFilter(_) => "cfilter",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::FeeFilter(_) => "feefilter",
            Message::SendHeaders => "sendheaders",
            Message::Reject(_) => "reject",
            Message::Unknown(command) => command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(msg) => {
                encoder.write_u32_le(msg.version);
                encoder.write_u64_le(msg.services);
                encoder.write_i64_le(msg.timestamp);
                write_short_net_addr(&mut encoder, msg.services, None);
                write_short_net_addr(&mut encoder, msg.services, None);
                encoder.write_u64_le(msg.nonce);
                encoder.write_var_str(&msg.user_agent);
                encoder.write_i32_le(msg.start_height);
                encoder.write_u8(u8::from(msg.relay));
            }
            Message::Verack | Message::GetAddr | Message::SendHeaders | Message::Unknown(_) => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::Addr(entries) => {
                encoder.write_varint(entries.len() as u64);
                for entry in entries {
                    encoder.write_u32_le(entry.timestamp);
                    write_short_net_addr(&mut encoder, entry.services, Some(entry.addr));
                }
            }
            Message::Inv(invs) | Message::GetData(invs) | Message::NotFound(invs) => {
                encoder.write_varint(invs.len() as u64);
                for inv in invs {
                    encoder.write_u32_le(inv.inv_type);
                    encoder.write_hash(&inv.hash);
                }
            }
            Message::GetHeaders { locator, stop } => {
                write_locator(&mut encoder, locator, stop);
            }
            Message::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode_to(&mut encoder);
                    encoder.write_varint(0);
                }
            }
            Message::GetCFHeaders {
                locator,
                stop,
                extended,
            } => {
                write_locator(&mut encoder, locator, stop);
                encoder.write_u8(u8::from(*extended));
            }
            Message::CFHeaders(msg) => {
                encoder.write_hash(&msg.stop_hash);
                encoder.write_hash(&msg.prev_filter_header);
                encoder.write_u8(u8::from(msg.extended));
                encoder.write_varint(msg.filter_hashes.len() as u64);
                for hash in &msg.filter_hashes {
                    encoder.write_hash(hash);
                }
            }
            Message::GetCFilter {
                block_hash,
                extended,
            } => {
                encoder.write_hash(block_hash);
                encoder.write_u8(u8::from(*extended));
            }
            Message::CFilter(msg) => {
                encoder.write_hash(&msg.block_hash);
                encoder.write_u8(u8::from(msg.extended));
                encoder.write_var_bytes(&msg.filter);
            }
            Message::Block(block) => {
                encoder.write_bytes(&block.consensus_encode());
            }
            Message::Tx(raw) => encoder.write_bytes(raw),
            Message::FeeFilter(min_fee) => encoder.write_i64_le(*min_fee),
            Message::Reject(msg) => {
                encoder.write_var_str(&msg.message);
                encoder.write_u8(msg.code);
                encoder.write_var_str(&msg.reason);
            }
        }
        encoder.into_inner()
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, WireError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => {
                let version = decoder.read_u32_le()?;
                let services = decoder.read_u64_le()?;
                let timestamp = decoder.read_i64_le()?;
                read_short_net_addr(&mut decoder)?;
                read_short_net_addr(&mut decoder)?;
                let nonce = decoder.read_u64_le()?;
                let user_agent = decoder.read_var_str()?;
                let start_height = decoder.read_i32_le()?;
                // The relay flag is optional in old implementations.
                let relay = decoder.read_u8().map(|byte| byte != 0).unwrap_or(true);
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::Verack,
            "ping" => Message::Ping(decoder.read_u64_le()?),
            "pong" => Message::Pong(decoder.read_u64_le()?),
            "getaddr" => Message::GetAddr,
            "sendheaders" => Message::SendHeaders,
            "addr" => {
                let count = read_count(&mut decoder, MAX_ADDR_PER_MSG, "addr")?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = decoder.read_u32_le()?;
                    let (services, addr) = read_net_addr(&mut decoder)?;
                    if let Some(addr) = addr {
                        entries.push(NetAddress {
                            timestamp,
                            services,
                            addr,
                        });
                    }
                }
                Message::Addr(entries)
            }
            "inv" => Message::Inv(read_inv_list(&mut decoder)?),
            "getdata" => Message::GetData(read_inv_list(&mut decoder)?),
            "notfound" => Message::NotFound(read_inv_list(&mut decoder)?),
            "getheaders" => {
                let (locator, stop) = read_locator(&mut decoder)?;
                Message::GetHeaders { locator, stop }
            }
            "headers" => {
                let count = read_count(&mut decoder, MAX_HEADERS_PER_MSG, "headers")?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode_from(&mut decoder)?);
                    let _tx_count = decoder.read_varint()?;
                }
                Message::Headers(headers)
            }
            "getcfheaders" => {
                let (locator, stop) = read_locator(&mut decoder)?;
                let extended = decoder.read_u8()? != 0;
                Message::GetCFHeaders {
                    locator,
                    stop,
                    extended,
                }
            }
            "cfheaders" => {
                let stop_hash = decoder.read_hash()?;
                let prev_filter_header = decoder.read_hash()?;
                let extended = decoder.read_u8()? != 0;
                let count = read_count(&mut decoder, MAX_HEADERS_PER_MSG, "cfheaders")?;
                let mut filter_hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    filter_hashes.push(decoder.read_hash()?);
                }
                Message::CFHeaders(CFHeadersMessage {
                    extended,
                    stop_hash,
                    prev_filter_header,
                    filter_hashes,
                })
            }
            "getcfilter" => {
                let block_hash = decoder.read_hash()?;
                let extended = decoder.read_u8()? != 0;
                Message::GetCFilter {
                    block_hash,
                    extended,
                }
            }
            "cfilter" => {
                let block_hash = decoder.read_hash()?;
                let extended = decoder.read_u8()? != 0;
                let filter = decoder.read_var_bytes()?;
                Message::CFilter(CFilterMessage {
                    extended,
                    block_hash,
                    filter,
                })
            }
            "block" => Message::Block(Block::consensus_decode(payload)?),
            "tx" => Message::Tx(payload.to_vec()),
            "feefilter" => Message::FeeFilter(decoder.read_i64_le()?),
            "reject" => {
                let message = decoder.read_var_str()?;
                let code = decoder.read_u8()?;
                let reason = decoder.read_var_str()?;
                Message::Reject(RejectMessage {
                    message,
                    code,
                    reason,
                })
            }
            other => Message::Unknown(other.to_string()),
        };
        Ok(message)
    }
}

/// Builds a complete framed message: envelope followed by payload.
pub fn build_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let cmd = command.as_bytes();
    if cmd.len() > 12 {
        return Err(WireError::CommandTooLong);
    }
    let mut frame = Vec::with_capacity(ENVELOPE_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parsed envelope header: command and expected payload length.
pub fn parse_envelope(
    magic: [u8; 4],
    header: &[u8; ENVELOPE_SIZE],
) -> Result<(String, usize, [u8; 4]), WireError> {
    if header[..4] != magic {
        return Err(WireError::BadMagic);
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::OversizedPayload(length));
    }
    let checksum = [header[20], header[21], header[22], header[23]];
    Ok((command, length, checksum))
}

pub fn verify_checksum(payload: &[u8], checksum: &[u8; 4]) -> Result<(), WireError> {
    let calc = sha256d(payload);
    if &calc[..4] != checksum {
        return Err(WireError::BadChecksum);
    }
    Ok(())
}

fn read_count(
    decoder: &mut Decoder<'_>,
    max: usize,
    what: &'static str,
) -> Result<usize, WireError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| WireError::CountExceeded(what))?;
    if count > max {
        return Err(WireError::CountExceeded(what));
    }
    Ok(count)
}

fn read_inv_list(decoder: &mut Decoder<'_>) -> Result<Vec<InventoryVector>, WireError> {
    let count = read_count(decoder, MAX_INV_PER_MSG, "inventory")?;
    let mut invs = Vec::with_capacity(count.min(4_096));
    for _ in 0..count {
        invs.push(InventoryVector {
            inv_type: decoder.read_u32_le()?,
            hash: decoder.read_hash()?,
        });
    }
    Ok(invs)
}

fn write_locator(encoder: &mut Encoder, locator: &[Hash256], stop: &Hash256) {
    encoder.write_u32_le(spvd_consensus::constants::PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(stop);
}

fn read_locator(decoder: &mut Decoder<'_>) -> Result<(Vec<Hash256>, Hash256), WireError> {
    let _version = decoder.read_u32_le()?;
    let count = read_count(decoder, MAX_LOCATOR_HASHES, "locator")?;
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash()?);
    }
    let stop = decoder.read_hash()?;
    Ok((locator, stop))
}

fn write_short_net_addr(encoder: &mut Encoder, services: u64, addr: Option<SocketAddr>) {
    encoder.write_u64_le(services);
    match addr {
        Some(addr) => {
            let ip6 = match addr.ip() {
                IpAddr::V4(ip4) => ip4.to_ipv6_mapped(),
                IpAddr::V6(ip6) => ip6,
            };
            encoder.write_bytes(&ip6.octets());
            encoder.write_bytes(&addr.port().to_be_bytes());
        }
        None => {
            encoder.write_bytes(&[0u8; 16]);
            encoder.write_bytes(&0u16.to_be_bytes());
        }
    }
}

fn read_short_net_addr(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    let _services = decoder.read_u64_le()?;
    let _ip = decoder.read_fixed::<16>()?;
    let _port = decoder.read_bytes(2)?;
    Ok(())
}

/// Reads one addr-message entry; unroutable entries come back as `None`.
fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(u64, Option<SocketAddr>), DecodeError> {
    let services = decoder.read_u64_le()?;
    let ip_bytes = decoder.read_fixed::<16>()?;
    let port_bytes = decoder.read_bytes(2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    if port == 0 {
        return Ok((services, None));
    }
    let ip6 = Ipv6Addr::from(ip_bytes);
    let ip = if let Some(ip4) = ip6.to_ipv4_mapped() {
        IpAddr::V4(ip4)
    } else {
        IpAddr::V6(ip6)
    };
    if ip.is_unspecified() || ip.is_loopback() {
        return Ok((services, None));
    }
    Ok((services, Some(SocketAddr::new(ip, port))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let payload = message.encode_payload();
        let decoded = Message::decode(message.command(), &payload).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn headers_roundtrip_drops_tx_count() {
        let header = BlockHeader {
            version: 1,
            prev_block: [0x33; 32],
            merkle_root: [0x44; 32],
            time: 100,
            bits: 0x207f_ffff,
            nonce: 9,
        };
        roundtrip(Message::Headers(vec![header, header]));
    }

    #[test]
    fn cfheaders_roundtrip() {
        roundtrip(Message::CFHeaders(CFHeadersMessage {
            extended: true,
            stop_hash: [0x10; 32],
            prev_filter_header: [0x20; 32],
            filter_hashes: vec![[0x30; 32], [0x31; 32]],
        }));
    }

    #[test]
    fn getheaders_roundtrip() {
        roundtrip(Message::GetHeaders {
            locator: vec![[0x01; 32], [0x02; 32]],
            stop: [0u8; 32],
        });
    }

    #[test]
    fn envelope_roundtrip_and_checksum() {
        let magic = [0x16, 0x1c, 0x14, 0x12];
        let payload = Message::Ping(7).encode_payload();
        let frame = build_frame(magic, "ping", &payload).expect("frame");
        let mut header = [0u8; ENVELOPE_SIZE];
        header.copy_from_slice(&frame[..ENVELOPE_SIZE]);
        let (command, length, checksum) = parse_envelope(magic, &header).expect("envelope");
        assert_eq!(command, "ping");
        assert_eq!(length, payload.len());
        verify_checksum(&payload, &checksum).expect("checksum");
        assert!(verify_checksum(&[0xff], &checksum).is_err());
    }

    #[test]
    fn oversized_inventory_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_INV_PER_MSG as u64 + 1);
        let err = Message::decode("inv", &encoder.into_inner());
        assert!(matches!(err, Err(WireError::CountExceeded("inventory"))));
    }

    #[test]
    fn addr_drops_unroutable_entries() {
        let routable = NetAddress {
            timestamp: 5,
            services: 1,
            addr: "8.8.8.8:8333".parse().unwrap(),
        };
        let unroutable = NetAddress {
            timestamp: 5,
            services: 1,
            addr: "127.0.0.1:8333".parse().unwrap(),
        };
        let payload = Message::Addr(vec![routable, unroutable]).encode_payload();
        let decoded = Message::decode("addr", &payload).expect("decode");
        assert_eq!(decoded, Message::Addr(vec![routable]));
    }
}
