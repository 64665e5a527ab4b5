//! DNS wire format
//!
//! Just enough of RFC 1035 to read the first question of a query and to
//! build the handful of replies the responder synthesizes itself. Upstream
//! replies are relayed as raw bytes and never re-encoded.

use std::net::IpAddr;

/// DNS packet constants
pub const DNS_HEADER_SIZE: usize = 12;
pub const MAX_UDP_PACKET_SIZE: usize = 4096;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

/// DNS record types
pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// DNS flags
pub const FLAG_QR: u16 = 0x8000; // Query/Response
pub const FLAG_AA: u16 = 0x0400; // Authoritative Answer
pub const FLAG_TC: u16 = 0x0200; // Truncated
pub const FLAG_RD: u16 = 0x0100; // Recursion Desired
pub const FLAG_RA: u16 = 0x0080; // Recursion Available
const OPCODE_MASK: u16 = 0x7800;

/// Response codes
pub const RCODE_NOERROR: u16 = 0;
pub const RCODE_FORMERR: u16 = 1;
pub const RCODE_SERVFAIL: u16 = 2;

/// Offset of the first question, target of answer name pointers
const QUESTION_OFFSET: u16 = DNS_HEADER_SIZE as u16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet shorter than a DNS header")]
    ShortHeader,

    #[error("truncated question")]
    Truncated,

    #[error("invalid label length byte {0:#04x}")]
    BadLabel(u8),

    #[error("name exceeds 255 bytes")]
    NameTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        if packet.len() < DNS_HEADER_SIZE {
            return Err(WireError::ShortHeader);
        }
        let word = |i: usize| u16::from_be_bytes([packet[i], packet[i + 1]]);

        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000F
    }
}

/// First question of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Dotted name without the trailing dot, case preserved
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Encoded question, echoed verbatim in synthesized replies
    raw: Vec<u8>,
}

/// Parse the first question following the header
///
/// Compression pointers are not legal in a query's question and are rejected.
pub fn parse_question(packet: &[u8]) -> Result<Question, WireError> {
    if packet.len() < DNS_HEADER_SIZE {
        return Err(WireError::ShortHeader);
    }
    let data = &packet[DNS_HEADER_SIZE..];

    let mut labels = Vec::new();
    let mut name_len = 0usize;
    let mut offset = 0;

    loop {
        let len = *data.get(offset).ok_or(WireError::Truncated)?;
        offset += 1;

        if len == 0 {
            break;
        }
        if len as usize > MAX_LABEL_LEN {
            return Err(WireError::BadLabel(len));
        }

        let label = data
            .get(offset..offset + len as usize)
            .ok_or(WireError::Truncated)?;
        name_len += len as usize + 1;
        if name_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }

        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += len as usize;
    }

    let fixed = data.get(offset..offset + 4).ok_or(WireError::Truncated)?;
    let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);
    offset += 4;

    Ok(Question {
        name: labels.join("."),
        qtype,
        qclass,
        raw: data[..offset].to_vec(),
    })
}

/// Transaction ID of a packet, if it has a header
pub fn packet_id(packet: &[u8]) -> Option<u16> {
    (packet.len() >= 2).then(|| u16::from_be_bytes([packet[0], packet[1]]))
}

/// Overwrite the transaction ID in place
pub fn set_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&id.to_be_bytes());
    }
}

pub fn is_truncated(packet: &[u8]) -> bool {
    Header::parse(packet).is_ok_and(|h| h.is_truncated())
}

fn push_header(out: &mut Vec<u8>, request: &Header, rcode: u16, qdcount: u16, ancount: u16) {
    // Non-authoritative, recursion available; opcode and RD copied from the query
    let flags = FLAG_QR | FLAG_RA | (request.flags & (OPCODE_MASK | FLAG_RD)) | (rcode & 0x000F);

    out.extend_from_slice(&request.id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
}

/// Reply with no question and no answers
pub fn empty_reply(request: &Header) -> Vec<u8> {
    let mut out = Vec::with_capacity(DNS_HEADER_SIZE);
    push_header(&mut out, request, RCODE_NOERROR, 0, 0);
    out
}

/// Reply carrying one sinkhole record for the question
///
/// The record type follows the address family of `addr`.
pub fn sinkhole_reply(request: &Header, question: &Question, addr: IpAddr, ttl: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(DNS_HEADER_SIZE + question.raw.len() + 28);
    push_header(&mut out, request, RCODE_NOERROR, 1, 1);
    out.extend_from_slice(&question.raw);

    let name_ptr = 0xC000 | QUESTION_OFFSET; // Compression pointer
    out.extend_from_slice(&name_ptr.to_be_bytes());

    match addr {
        IpAddr::V4(ip) => {
            out.extend_from_slice(&TYPE_A.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes()); // rdlength
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.extend_from_slice(&TYPE_AAAA.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&16u16.to_be_bytes()); // rdlength
            out.extend_from_slice(&ip.octets());
        }
    }

    out
}

/// Error reply, echoing the question when one could be parsed
pub fn error_reply(request: &Header, question: Option<&Question>, rcode: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(DNS_HEADER_SIZE + question.map_or(0, |q| q.raw.len()));
    push_header(&mut out, request, rcode, question.is_some() as u16, 0);
    if let Some(question) = question {
        out.extend_from_slice(&question.raw);
    }
    out
}

/// Build a single-question query
#[cfg(test)]
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RD.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for part in name.trim_end_matches('.').split('.') {
        out.push(part.len() as u8);
        out.extend_from_slice(part.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out
}
