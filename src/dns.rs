//! DNS wire format.
//!
//! This module provides functions for building and parsing DNS messages:
//! client queries, upstream replies (including name compression), and the
//! responses sent back to clients.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::errors::DnsError;

/// Length of the fixed DNS message header.
pub const HEADER_LEN: usize = 12;

/// Response code: no error.
pub const RCODE_NOERROR: u8 = 0;

/// Response code: server failure.
pub const RCODE_SERVFAIL: u8 = 2;

/// Response code: name error (NXDOMAIN).
pub const RCODE_NXDOMAIN: u8 = 3;

/// Response code: not implemented.
pub const RCODE_NOTIMP: u8 = 4;

/// Upper bound on compression pointer jumps while decoding one name.
const MAX_POINTER_JUMPS: usize = 16;

/// Resource record types the resolver understands by name.
///
/// Anything else appearing in a reply is carried as `Other` with its raw
/// type code and opaque rdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Other(u16),
}

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            other => RecordType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Other(value) => value,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::Ns => write!(f, "NS"),
            RecordType::Cname => write!(f, "CNAME"),
            RecordType::Soa => write!(f, "SOA"),
            RecordType::Ptr => write!(f, "PTR"),
            RecordType::Mx => write!(f, "MX"),
            RecordType::Txt => write!(f, "TXT"),
            RecordType::Aaaa => write!(f, "AAAA"),
            RecordType::Other(value) => write!(f, "TYPE{}", value),
        }
    }
}

/// A client question: name plus record type. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    /// Query name, lowercased, without the trailing dot.
    pub name: String,

    /// Requested record type.
    pub qtype: RecordType,
}

/// SOA rdata fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SoaData {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Decoded rdata. Names inside rdata are decompressed at parse time so a
/// record can be re-encoded standalone.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Soa(SoaData),
    Other(Vec<u8>),
}

impl fmt::Display for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordData::A(ip) => write!(f, "{}", ip),
            RecordData::Aaaa(ip) => write!(f, "{}", ip),
            RecordData::Ns(name) => write!(f, "{}", name),
            RecordData::Cname(name) => write!(f, "{}", name),
            RecordData::Ptr(name) => write!(f, "{}", name),
            RecordData::Mx { preference, exchange } => write!(f, "{} {}", preference, exchange),
            RecordData::Soa(soa) => write!(f, "{}", soa.mname),
            RecordData::Other(bytes) => write!(f, "[{} bytes]", bytes.len()),
        }
    }
}

/// A parsed resource record, tagged with the server it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: RecordType,
    pub data: RecordData,
    pub ttl: u32,
    pub origin: SocketAddr,
}

/// A parsed client query.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub id: u16,
    pub question: Question,
}

/// A parsed upstream reply, split into its sections.
#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub id: u16,
    pub rcode: u8,
    pub authoritative: bool,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

/// Decode a domain name starting at `start`, following compression pointers.
///
/// Returns the lowercased name and the position just past the name at the
/// original nesting level.
fn read_name(packet: &[u8], start: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len_byte = *packet
            .get(pos)
            .ok_or_else(|| DnsError::Protocol("Name runs past end of packet".into()))?;

        if len_byte & 0xC0 == 0xC0 {
            let second = *packet
                .get(pos + 1)
                .ok_or_else(|| DnsError::Protocol("Truncated compression pointer".into()))?;
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(DnsError::Protocol("Compression pointer loop".into()));
            }
            pos = (((len_byte & 0x3F) as usize) << 8) | second as usize;
        } else if len_byte == 0 {
            if end.is_none() {
                end = Some(pos + 1);
            }
            break;
        } else {
            let len = len_byte as usize;
            let label = packet
                .get(pos + 1..pos + 1 + len)
                .ok_or_else(|| DnsError::Protocol("Label runs past end of packet".into()))?;
            let label = std::str::from_utf8(label)
                .map_err(|_| DnsError::Protocol("Label is not valid UTF-8".into()))?;
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&label.to_ascii_lowercase());
            pos += len + 1;
        }
    }

    Ok((name, end.unwrap_or(pos)))
}

fn read_u16(packet: &[u8], pos: usize) -> Result<u16, DnsError> {
    let bytes = packet
        .get(pos..pos + 2)
        .ok_or_else(|| DnsError::Protocol("Truncated message".into()))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(packet: &[u8], pos: usize) -> Result<u32, DnsError> {
    let bytes = packet
        .get(pos..pos + 4)
        .ok_or_else(|| DnsError::Protocol("Truncated message".into()))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode one resource record starting at `pos`.
fn read_record(
    packet: &[u8],
    pos: usize,
    origin: SocketAddr,
) -> Result<(ResourceRecord, usize), DnsError> {
    let (name, pos) = read_name(packet, pos)?;
    let rtype = RecordType::from_u16(read_u16(packet, pos)?);
    let ttl = read_u32(packet, pos + 4)?;
    let rdlen = read_u16(packet, pos + 8)? as usize;
    let rdata_start = pos + 10;
    let rdata = packet
        .get(rdata_start..rdata_start + rdlen)
        .ok_or_else(|| DnsError::Protocol("Rdata runs past end of packet".into()))?;

    let data = match rtype {
        RecordType::A => {
            if rdlen != 4 {
                return Err(DnsError::Protocol(format!("Bad A rdata length: {}", rdlen)));
            }
            RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
        }
        RecordType::Aaaa => {
            if rdlen != 16 {
                return Err(DnsError::Protocol(format!("Bad AAAA rdata length: {}", rdlen)));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::Ns => RecordData::Ns(read_name(packet, rdata_start)?.0),
        RecordType::Cname => RecordData::Cname(read_name(packet, rdata_start)?.0),
        RecordType::Ptr => RecordData::Ptr(read_name(packet, rdata_start)?.0),
        RecordType::Mx => {
            let preference = read_u16(packet, rdata_start)?;
            let exchange = read_name(packet, rdata_start + 2)?.0;
            RecordData::Mx { preference, exchange }
        }
        RecordType::Soa => {
            let (mname, after_mname) = read_name(packet, rdata_start)?;
            let (rname, after_rname) = read_name(packet, after_mname)?;
            RecordData::Soa(SoaData {
                mname,
                rname,
                serial: read_u32(packet, after_rname)?,
                refresh: read_u32(packet, after_rname + 4)?,
                retry: read_u32(packet, after_rname + 8)?,
                expire: read_u32(packet, after_rname + 12)?,
                minimum: read_u32(packet, after_rname + 16)?,
            })
        }
        _ => RecordData::Other(rdata.to_vec()),
    };

    Ok((
        ResourceRecord { name, rtype, data, ttl, origin },
        rdata_start + rdlen,
    ))
}

/// Parse an incoming client query.
///
/// Accepts only query messages (QR clear) carrying at least one question;
/// anything else is a protocol error and gets no reply.
pub fn parse_query(packet: &[u8]) -> Result<ParsedQuery, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Protocol("Message shorter than header".into()));
    }
    if packet[2] & 0x80 != 0 {
        return Err(DnsError::Protocol("Message is a response, not a query".into()));
    }
    let id = read_u16(packet, 0)?;
    let qdcount = read_u16(packet, 4)?;
    if qdcount == 0 {
        return Err(DnsError::Protocol("Query has no question".into()));
    }

    let (name, pos) = read_name(packet, HEADER_LEN)?;
    if name.is_empty() {
        return Err(DnsError::Protocol("Empty query name".into()));
    }
    let qtype = RecordType::from_u16(read_u16(packet, pos)?);
    read_u16(packet, pos + 2)?; // QCLASS must be present

    Ok(ParsedQuery {
        id,
        question: Question { name, qtype },
    })
}

/// Parse an upstream reply into its sections.
pub fn parse_reply(packet: &[u8], origin: SocketAddr) -> Result<ParsedReply, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Protocol("Message shorter than header".into()));
    }
    if packet[2] & 0x80 == 0 {
        return Err(DnsError::Protocol("Message is a query, not a response".into()));
    }

    let id = read_u16(packet, 0)?;
    let authoritative = packet[2] & 0x04 != 0;
    let rcode = packet[3] & 0x0F;
    let qdcount = read_u16(packet, 4)?;
    let ancount = read_u16(packet, 6)?;
    let nscount = read_u16(packet, 8)?;
    let arcount = read_u16(packet, 10)?;

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, after_name) = read_name(packet, pos)?;
        read_u16(packet, after_name + 2)?; // QTYPE and QCLASS must be present
        pos = after_name + 4;
    }

    let mut read_section = |count: u16, pos: &mut usize| -> Result<Vec<ResourceRecord>, DnsError> {
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (record, next) = read_record(packet, *pos, origin)?;
            *pos = next;
            records.push(record);
        }
        Ok(records)
    };

    let answers = read_section(ancount, &mut pos)?;
    let authorities = read_section(nscount, &mut pos)?;
    let additionals = read_section(arcount, &mut pos)?;

    Ok(ParsedReply {
        id,
        rcode,
        authoritative,
        answers,
        authorities,
        additionals,
    })
}

/// Encode a domain name in DNS wire format.
pub fn encode_dns_name(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for part in name.trim_end_matches('.').split('.') {
        if part.is_empty() || part.len() > 63 {
            continue; // Skip invalid labels
        }
        out.push(part.len() as u8);
        out.extend_from_slice(part.as_bytes());
    }
    out.push(0); // Null terminator
    out
}

/// Encode a query message for one question, with recursion desired off
/// (the resolver walks the delegation chain itself).
pub fn encode_query(id: u16, question: &Question) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // QR=0, OPCODE=0, RD=0
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    encode_question(&mut packet, question);
    packet
}

fn encode_question(packet: &mut Vec<u8>, question: &Question) {
    packet.extend_from_slice(&encode_dns_name(&question.name));
    packet.extend_from_slice(&question.qtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // Class IN
}

fn encode_record(packet: &mut Vec<u8>, record: &ResourceRecord) {
    packet.extend_from_slice(&encode_dns_name(&record.name));
    packet.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // Class IN
    packet.extend_from_slice(&record.ttl.to_be_bytes());

    let rdata = match &record.data {
        RecordData::A(ip) => ip.octets().to_vec(),
        RecordData::Aaaa(ip) => ip.octets().to_vec(),
        RecordData::Ns(name) | RecordData::Cname(name) | RecordData::Ptr(name) => {
            encode_dns_name(name)
        }
        RecordData::Mx { preference, exchange } => {
            let mut rdata = preference.to_be_bytes().to_vec();
            rdata.extend_from_slice(&encode_dns_name(exchange));
            rdata
        }
        RecordData::Soa(soa) => {
            let mut rdata = encode_dns_name(&soa.mname);
            rdata.extend_from_slice(&encode_dns_name(&soa.rname));
            rdata.extend_from_slice(&soa.serial.to_be_bytes());
            rdata.extend_from_slice(&soa.refresh.to_be_bytes());
            rdata.extend_from_slice(&soa.retry.to_be_bytes());
            rdata.extend_from_slice(&soa.expire.to_be_bytes());
            rdata.extend_from_slice(&soa.minimum.to_be_bytes());
            rdata
        }
        RecordData::Other(bytes) => bytes.clone(),
    };

    packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    packet.extend_from_slice(&rdata);
}

/// Build a reply message.
///
/// Used both for responses to clients and, in tests, for mock upstream
/// servers. Names are always encoded in full; compression is never emitted.
pub fn build_reply(
    id: u16,
    question: &Question,
    rcode: u8,
    authoritative: bool,
    answers: &[ResourceRecord],
    authorities: &[ResourceRecord],
    additionals: &[ResourceRecord],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&id.to_be_bytes());

    // QR = 1, OPCODE = 0, AA per caller, TC = 0, RD = 0, RA = 0
    let flags1 = 0x80 | if authoritative { 0x04 } else { 0x00 };
    packet.push(flags1);
    packet.push(rcode & 0x0F);

    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    packet.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    packet.extend_from_slice(&(authorities.len() as u16).to_be_bytes());
    packet.extend_from_slice(&(additionals.len() as u16).to_be_bytes());

    encode_question(&mut packet, question);
    for record in answers.iter().chain(authorities).chain(additionals) {
        encode_record(&mut packet, record);
    }

    packet
}

/// Build a "not implemented" response for a query with an unsupported opcode.
///
/// Echoes the transaction ID, opcode, RD bit, and question section.
pub fn build_notimp_response(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let mut resp = Vec::with_capacity(512);
    resp.extend_from_slice(&query[0..2]);

    let opcode = query[2] & 0x78;
    let rd = query[2] & 0x01;
    resp.push(0x80 | opcode | rd); // QR=1
    resp.push(RCODE_NOTIMP);

    // Copy QDCOUNT from query
    resp.extend_from_slice(&query[4..6]);
    resp.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    // Walk the question section to find its end
    let mut pos = HEADER_LEN;
    loop {
        if pos >= query.len() {
            return None;
        }
        let len = query[pos] as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        pos += len + 1;
    }
    if pos + 4 > query.len() {
        return None;
    }
    pos += 4;

    resp.extend_from_slice(&query[HEADER_LEN..pos]);
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> SocketAddr {
        "192.0.2.1:53".parse().unwrap()
    }

    fn question(name: &str, qtype: RecordType) -> Question {
        Question { name: name.into(), qtype }
    }

    #[test]
    fn parses_a_plain_query() {
        let packet = encode_query(0x1234, &question("example.com", RecordType::A));
        let parsed = parse_query(&packet).unwrap();
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.question.name, "example.com");
        assert_eq!(parsed.question.qtype, RecordType::A);
    }

    #[test]
    fn query_name_is_lowercased() {
        let mut packet = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(b"\x07EXAMPLE\x03CoM\x00");
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        let parsed = parse_query(&packet).unwrap();
        assert_eq!(parsed.question.name, "example.com");
    }

    #[test]
    fn rejects_truncated_and_response_packets() {
        assert!(parse_query(&[0u8; 5]).is_err());

        let mut response = encode_query(1, &question("example.com", RecordType::A));
        response[2] |= 0x80;
        assert!(parse_query(&response).is_err());
    }

    #[test]
    fn rejects_query_without_question() {
        let packet = [0x00u8, 0x01, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0];
        assert!(parse_query(&packet).is_err());
    }

    #[test]
    fn reply_sections_survive_build_and_parse() {
        let q = question("example.com", RecordType::A);
        let answer = ResourceRecord {
            name: "example.com".into(),
            rtype: RecordType::A,
            data: RecordData::A("93.184.216.34".parse().unwrap()),
            ttl: 300,
            origin: origin(),
        };
        let authority = ResourceRecord {
            name: "com".into(),
            rtype: RecordType::Ns,
            data: RecordData::Ns("ns1.example.com".into()),
            ttl: 172800,
            origin: origin(),
        };
        let glue = ResourceRecord {
            name: "ns1.example.com".into(),
            rtype: RecordType::A,
            data: RecordData::A("192.0.2.10".parse().unwrap()),
            ttl: 172800,
            origin: origin(),
        };

        let packet = build_reply(7, &q, RCODE_NOERROR, true, &[answer.clone()], &[authority], &[glue]);
        let reply = parse_reply(&packet, origin()).unwrap();

        assert_eq!(reply.id, 7);
        assert!(reply.authoritative);
        assert_eq!(reply.rcode, RCODE_NOERROR);
        assert_eq!(reply.answers, vec![answer]);
        assert_eq!(reply.authorities.len(), 1);
        assert_eq!(reply.authorities[0].data, RecordData::Ns("ns1.example.com".into()));
        assert_eq!(reply.additionals.len(), 1);
        assert_eq!(reply.additionals[0].name, "ns1.example.com");
    }

    #[test]
    fn decodes_compressed_names() {
        // Header + question "abc.example" + one answer whose name is a
        // pointer back to the question name.
        let mut packet = vec![0x00, 0x09, 0x80, 0x00, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0];
        packet.extend_from_slice(b"\x03abc\x07example\x00");
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        packet.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // TYPE A, CLASS IN
        packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]); // TTL 60
        packet.extend_from_slice(&[0x00, 0x04, 192, 0, 2, 7]);

        let reply = parse_reply(&packet, origin()).unwrap();
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].name, "abc.example");
        assert_eq!(reply.answers[0].data, RecordData::A("192.0.2.7".parse().unwrap()));
        assert_eq!(reply.answers[0].ttl, 60);
    }

    #[test]
    fn pointer_loops_are_rejected() {
        // A name that is a pointer to itself.
        let mut packet = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        assert!(parse_query(&packet).is_err());
    }

    #[test]
    fn soa_and_mx_rdata_round_trip() {
        let q = question("example.com", RecordType::Soa);
        let soa = ResourceRecord {
            name: "example.com".into(),
            rtype: RecordType::Soa,
            data: RecordData::Soa(SoaData {
                mname: "ns1.example.com".into(),
                rname: "hostmaster.example.com".into(),
                serial: 1,
                refresh: 10800,
                retry: 3600,
                expire: 604800,
                minimum: 86400,
            }),
            ttl: 600,
            origin: origin(),
        };
        let mx = ResourceRecord {
            name: "example.com".into(),
            rtype: RecordType::Mx,
            data: RecordData::Mx { preference: 10, exchange: "mail.example.com".into() },
            ttl: 600,
            origin: origin(),
        };

        let packet = build_reply(9, &q, RCODE_NOERROR, true, &[soa.clone(), mx.clone()], &[], &[]);
        let reply = parse_reply(&packet, origin()).unwrap();
        assert_eq!(reply.answers, vec![soa, mx]);
    }

    #[test]
    fn notimp_response_echoes_question_and_sets_rcode() {
        let mut query = encode_query(0x0BAD, &question("example.com", RecordType::A));
        query[2] |= 0x10 | 0x01; // opcode 2 (status), RD set

        let resp = build_notimp_response(&query).unwrap();
        assert_eq!(&resp[0..2], &query[0..2]);
        assert_eq!(resp[2] & 0x80, 0x80);
        assert_eq!(resp[2] & 0x78, 0x10);
        assert_eq!(resp[2] & 0x01, 0x01);
        assert_eq!(resp[3] & 0x0F, RCODE_NOTIMP);
        // Question section copied verbatim
        assert_eq!(&resp[HEADER_LEN..], &query[HEADER_LEN..]);
    }
}
