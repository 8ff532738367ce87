use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};

/// Maximum DATA payload per RFC 1350.
pub const BLOCK_SIZE: usize = 512;

/// Opcode plus block number.
pub const DATA_HEADER_LEN: usize = 4;

/// The largest well-formed packet on the wire: a full DATA block.
pub const MAX_PACKET_LEN: usize = DATA_HEADER_LEN + BLOCK_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    /// The token sent on the wire. Always lowercase.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }

    /// Whether transfers in this mode pass through the NETASCII translator.
    pub fn is_text(&self) -> bool {
        !matches!(self, FileMode::Octet)
    }
}

impl FromStr for FileMode {
    type Err = String;

    // Mode tokens are matched case-insensitively on receive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => Err(format!("Unknown file mode: '{s}'")),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP error code surfaced by a TFTP Error packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    /// Unrecognized codes decode as `Undefined`, the RFC's catch-all.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, &c) in buf.iter().enumerate() {
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

/// Utility enum for the TFTP opcode at the front of every packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!(
            "Unknown opcode retrieved: {rawcode}"
        ))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse(
            "Request does not contain a mode, but it needs to!".to_string(),
        ));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err(SocketError::PacketParse(
            "Mode must be terminated with a null byte!".to_string(),
        ));
    }

    let mode = raw_mode
        .parse::<FileMode>()
        .map_err(SocketError::PacketParse)?;

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data {
        block,
        data: Vec::from(&buf[4..]),
    })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 5 {
        return Err(SocketError::PacketParse(
            "Error packet too short!".to_string(),
        ));
    }

    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));

    // A message with no terminating null reads as empty rather than failing;
    // the error code alone is still actionable.
    let (message, message_end) = string_from_buffer(&buf[4..]);
    let message = if message_end == buf.len() - 4 {
        String::new()
    } else {
        message
    };

    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Serializes the packet into `buf` in network byte order, replacing its
    /// previous contents.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_LEN);
        self.encode_into(&mut buf);
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    send_buf: Vec<u8>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            send_buf: Vec::with_capacity(MAX_PACKET_LEN),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    /// Serializes `packet` into the reusable outbound buffer and sends it to
    /// `dst` as a single datagram.
    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        packet.encode_into(&mut self.send_buf);
        self.sock.send_to(&self.send_buf, dst).await?;
        Ok(())
    }

    /// Waits for the next datagram until `deadline` and parses it.
    ///
    /// A datagram longer than one full DATA packet was truncated somewhere
    /// along the way and is rejected the same way as a malformed one.
    pub async fn recv_until(&self, deadline: Instant) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_LEN + 1];
        let (total_written, src) = timeout_at(deadline, self.sock.recv_from(&mut buf)).await??;

        if total_written > MAX_PACKET_LEN {
            return Err(SocketError::PacketParse(
                "Datagram exceeds the maximum packet length!".to_string(),
            ));
        }

        let packet = Packet::parse_from_buf(&buf[..total_written])?;
        Ok((packet, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E,
            0x74, 0x78, 0x74, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::ReadReq {
                path: "/path/to/data.txt".to_string(),
                mode: FileMode::Mail
            }
        );
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E,
            0x74, 0x78, 0x74, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::WriteReq {
                path: "/path/to/data.txt".to_string(),
                mode: FileMode::Mail
            }
        );
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Data {
                block: 0x1234,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF]
            }
        );
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal! with terminating nullchar
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Error {
                code: ErrorCode::Illegal,
                message: "Illegal!".to_string()
            }
        );
    }

    #[test]
    fn test_packet_error_without_terminator_reads_empty() {
        let buf = vec![0x00, 0x05, 0x00, 0x01, 0x6E, 0x6F, 0x70, 0x65];
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: String::new()
            }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Invalid opcodes
        assert!(Packet::parse_from_buf(&[0x10]).is_err());
        assert!(Packet::parse_from_buf(&[0x10, 0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x09, 0x00, 0x00]).is_err());
        // Invalid read path
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Invalid mode string
        assert!(
            Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00])
                .is_err()
        );
        // Mode missing its null terminator
        assert!(Packet::parse_from_buf(&[
            0x00, 0x02, 0x68, 0x69, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74
        ])
        .is_err());
    }

    #[test]
    fn test_mode_tokens_are_case_insensitive() {
        assert_eq!("OCTET".parse::<FileMode>().unwrap(), FileMode::Octet);
        assert_eq!("NetAscii".parse::<FileMode>().unwrap(), FileMode::NetAscii);
        assert_eq!("Mail".parse::<FileMode>().unwrap(), FileMode::Mail);
        assert!("binary".parse::<FileMode>().is_err());
    }

    #[test]
    fn test_encode_write_req() {
        let packet = Packet::WriteReq {
            path: "data.bin".to_string(),
            mode: FileMode::Octet,
        };
        assert_eq!(packet.to_bytes(), b"\x00\x02data.bin\x00octet\x00".to_vec());
    }

    #[test]
    fn test_encode_ack_and_data() {
        let ack = Packet::Ack { block: 0x102f };
        assert_eq!(ack.to_bytes(), vec![0x00, 0x04, 0x10, 0x2f]);

        let data = Packet::Data {
            block: 2,
            data: vec![0xDE, 0xAD],
        };
        assert_eq!(data.to_bytes(), vec![0x00, 0x03, 0x00, 0x02, 0xDE, 0xAD]);
    }

    #[test]
    fn test_encode_error() {
        let packet = Packet::Error {
            code: ErrorCode::UnknownTid,
            message: "Unknown TID.".to_string(),
        };
        assert_eq!(
            packet.to_bytes(),
            b"\x00\x05\x00\x05Unknown TID.\x00".to_vec()
        );
    }

    #[test]
    fn test_round_trip_all_variants() {
        let packets = vec![
            Packet::ReadReq {
                path: "remote.txt".to_string(),
                mode: FileMode::NetAscii,
            },
            Packet::WriteReq {
                path: "remote.txt".to_string(),
                mode: FileMode::Octet,
            },
            Packet::Data {
                block: 0xFFFF,
                data: vec![0; BLOCK_SIZE],
            },
            Packet::Ack { block: 0 },
            Packet::Error {
                code: ErrorCode::DiskFull,
                message: "Disk full".to_string(),
            },
        ];

        for packet in packets {
            let parsed = Packet::parse_from_buf(&packet.to_bytes()).unwrap();
            assert_eq!(parsed, packet);
        }
    }

    #[test]
    fn test_error_code_mapping() {
        for raw in 0..=7 {
            assert_eq!(ErrorCode::from_u16(raw).as_u16(), raw);
        }
        assert_eq!(ErrorCode::from_u16(99), ErrorCode::Undefined);
    }
}
