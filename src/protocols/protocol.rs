// implementation of the dns protocol subset the daemon speaks

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::buffer::buffer;
use crate::buffer::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Lower-cases a domain name and strips the trailing root dot, so that
/// `EXAMPLE.COM` and `example.com.` compare equal.
pub fn clean_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

/// Represents the dns query types the daemon tracks.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    /// Represents an unrecognized or custom DNS query type.
    UNKNOWN(u16),
    /// IPv4 address query.
    A, // 1
    /// Canonical name.
    CNAME, // 5
    /// Reverse-lookup pointer.
    PTR, // 12
    /// Text record query.
    TXT, // 16
    /// IPv6 address query.
    AAAA, // 28
}

impl QueryType {
    /// Converts the `QueryType` enum to its corresponding numeric code.
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::UNKNOWN(x) => x,
            QueryType::A => 1,
            QueryType::CNAME => 5,
            QueryType::PTR => 12,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
        }
    }

    /// Creates a `QueryType` from a numeric code.
    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            5 => QueryType::CNAME,
            12 => QueryType::PTR,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            _ => QueryType::UNKNOWN(num),
        }
    }

    /// Parses the presentation name used in target URLs (`type=AAAA`).
    pub fn from_name(name: &str) -> Option<QueryType> {
        match name.to_uppercase().as_str() {
            "A" => Some(QueryType::A),
            "CNAME" => Some(QueryType::CNAME),
            "PTR" => Some(QueryType::PTR),
            "TXT" => Some(QueryType::TXT),
            "AAAA" => Some(QueryType::AAAA),
            _ => None,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            QueryType::UNKNOWN(x) => write!(f, "TYPE{}", x),
            QueryType::A => write!(f, "A"),
            QueryType::CNAME => write!(f, "CNAME"),
            QueryType::PTR => write!(f, "PTR"),
            QueryType::TXT => write!(f, "TXT"),
            QueryType::AAAA => write!(f, "AAAA"),
        }
    }
}

/// Represents the dns record classes.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryClass {
    IN, // 1
    CH, // 3
    HS, // 4
    UNKNOWN(u16),
}

impl Default for QueryClass {
    fn default() -> Self {
        QueryClass::IN
    }
}

impl QueryClass {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryClass::IN => 1,
            QueryClass::CH => 3,
            QueryClass::HS => 4,
            QueryClass::UNKNOWN(x) => x,
        }
    }

    pub fn from_num(num: u16) -> QueryClass {
        match num {
            1 => QueryClass::IN,
            3 => QueryClass::CH,
            4 => QueryClass::HS,
            _ => QueryClass::UNKNOWN(num),
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            QueryClass::IN => write!(f, "IN"),
            QueryClass::CH => write!(f, "CH"),
            QueryClass::HS => write!(f, "HS"),
            QueryClass::UNKNOWN(x) => write!(f, "CLASS{}", x),
        }
    }
}

/// TTL wrapper that is invisible to equality, ordering and hashing.
///
/// Two records differing only in TTL are the same record as far as diffing
/// and de-duplication are concerned.
#[derive(Copy, Clone, Debug, Eq, Ord, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq for TransientTtl {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl PartialOrd for TransientTtl {
    fn partial_cmp(&self, _: &Self) -> Option<Ordering> {
        Some(Ordering::Equal)
    }
}

impl TransientTtl {
    /// Returns the underlying TTL value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// The identity of a watched name: question name, class and type.
///
/// The canonical key is `name:class:type` with the name cleaned, so casing
/// and trailing-dot variants of the same question collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub name: String,
    pub qclass: QueryClass,
    pub qtype: QueryType,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> Self {
        Self {
            name,
            qclass: QueryClass::IN,
            qtype,
        }
    }

    /// The canonical registry key for this question.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", clean_name(&self.name), self.qclass, self.qtype)
    }

    /// Calculates the binary length of the question.
    pub fn binary_len(&self) -> usize {
        self.name.split('.').map(|x| x.len() + 1).sum::<usize>() + 1 + 4
    }

    /// Writes the question to a packet buffer.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass.to_num())?;
        Ok(())
    }

    /// Reads a question from the packet buffer.
    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = QueryClass::from_num(buffer.read_u16()?);
        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

/// `DnsRecord` is the primary representation of a resolved answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    UNKNOWN {
        domain: String,
        qtype: u16,
        data_len: u16,
        ttl: TransientTtl,
    },
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    },
    CNAME {
        domain: String,
        host: String,
        ttl: TransientTtl,
    },
    PTR {
        domain: String,
        host: String,
        ttl: TransientTtl,
    },
    TXT {
        domain: String,
        data: Vec<String>,
        ttl: TransientTtl,
    },
    AAAA {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    },
}

impl DnsRecord {
    /// The byte-stable representation used for sorting, equality and diff.
    ///
    /// TTL never appears here. Addresses serialize with zero-padded octets
    /// so lexicographic order equals numeric order.
    pub fn canonical_form(&self) -> String {
        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ..
            } => {
                let o = addr.octets();
                format!(
                    "{} IN A {:03}.{:03}.{:03}.{:03}",
                    clean_name(domain),
                    o[0],
                    o[1],
                    o[2],
                    o[3]
                )
            }
            DnsRecord::AAAA {
                ref domain,
                ref addr,
                ..
            } => {
                let padded = addr
                    .octets()
                    .iter()
                    .map(|o| format!("{:03}", o))
                    .collect::<Vec<_>>()
                    .join(".");
                format!("{} IN AAAA {}", clean_name(domain), padded)
            }
            DnsRecord::CNAME {
                ref domain,
                ref host,
                ..
            } => format!("{} IN CNAME {}", clean_name(domain), clean_name(host)),
            DnsRecord::PTR {
                ref domain,
                ref host,
                ..
            } => format!("{} IN PTR {}", clean_name(domain), clean_name(host)),
            DnsRecord::TXT {
                ref domain,
                ref data,
                ..
            } => {
                let texts = data
                    .iter()
                    .map(|t| format!("\"{}\"", t))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{} IN TXT {}", clean_name(domain), texts)
            }
            DnsRecord::UNKNOWN {
                ref domain,
                qtype,
                data_len,
                ..
            } => format!("{} IN TYPE{} len{}", clean_name(domain), qtype, data_len),
        }
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let _class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        match qtype {
            QueryType::A => Self::read_a_record(buffer, domain, ttl),
            QueryType::AAAA => Self::read_aaaa_record(buffer, domain, ttl),
            QueryType::CNAME => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                Ok(DnsRecord::CNAME {
                    domain,
                    host,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::PTR => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                Ok(DnsRecord::PTR {
                    domain,
                    host,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::TXT => Self::read_txt_record(buffer, domain, ttl, data_len),
            QueryType::UNKNOWN(_) => {
                buffer.step(data_len as usize)?;
                Ok(DnsRecord::UNKNOWN {
                    domain,
                    qtype: qtype_num,
                    data_len,
                    ttl: TransientTtl(ttl),
                })
            }
        }
    }

    fn read_a_record<T: PacketBuffer>(buffer: &mut T, domain: String, ttl: u32) -> Result<DnsRecord> {
        let raw_addr = buffer.read_u32()?;
        let addr = Ipv4Addr::new(
            ((raw_addr >> 24) & 0xFF) as u8,
            ((raw_addr >> 16) & 0xFF) as u8,
            ((raw_addr >> 8) & 0xFF) as u8,
            (raw_addr & 0xFF) as u8,
        );

        Ok(DnsRecord::A {
            domain,
            addr,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_aaaa_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let raw_addr1 = buffer.read_u32()?;
        let raw_addr2 = buffer.read_u32()?;
        let raw_addr3 = buffer.read_u32()?;
        let raw_addr4 = buffer.read_u32()?;
        let addr = Ipv6Addr::new(
            ((raw_addr1 >> 16) & 0xFFFF) as u16,
            (raw_addr1 & 0xFFFF) as u16,
            ((raw_addr2 >> 16) & 0xFFFF) as u16,
            (raw_addr2 & 0xFFFF) as u16,
            ((raw_addr3 >> 16) & 0xFFFF) as u16,
            (raw_addr3 & 0xFFFF) as u16,
            ((raw_addr4 >> 16) & 0xFFFF) as u16,
            (raw_addr4 & 0xFFFF) as u16,
        );

        Ok(DnsRecord::AAAA {
            domain,
            addr,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_txt_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
        data_len: u16,
    ) -> Result<DnsRecord> {
        // TXT rdata is a sequence of length-prefixed character strings.
        let mut data = Vec::new();
        let end = buffer.pos() + data_len as usize;
        while buffer.pos() < end {
            let len = buffer.read()? as usize;
            let start = buffer.pos();
            let text = String::from_utf8_lossy(buffer.get_range(start, len)?).to_string();
            buffer.step(len)?;
            data.push(text);
        }

        Ok(DnsRecord::TXT {
            domain,
            data,
            ttl: TransientTtl(ttl),
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        // Helper to write the shared record preamble (qname, type, class, ttl).
        fn write_common<T: PacketBuffer>(
            buffer: &mut T,
            domain: &str,
            query_type: QueryType,
            ttl: u32,
        ) -> Result<()> {
            buffer.write_qname(domain)?;
            buffer.write_u16(query_type.to_num())?;
            buffer.write_u16(QueryClass::IN.to_num())?;
            buffer.write_u32(ttl)?;
            Ok(())
        }

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::A, ttl)?;
                buffer.write_u16(4)?;
                for &octet in &addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            DnsRecord::AAAA {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::AAAA, ttl)?;
                buffer.write_u16(16)?;
                for &segment in &addr.segments() {
                    buffer.write_u16(segment)?;
                }
            }
            DnsRecord::CNAME {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::CNAME, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::PTR {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::PTR, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::TXT {
                ref domain,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::TXT, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                for text in data {
                    buffer.write_u8(text.len() as u8)?;
                    for &b in text.as_bytes() {
                        buffer.write_u8(b)?;
                    }
                }
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::UNKNOWN { .. } => {
                tracing::debug!(record = ?self, "skipping write of unknown record");
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::AAAA { .. } => QueryType::AAAA,
            DnsRecord::CNAME { .. } => QueryType::CNAME,
            DnsRecord::PTR { .. } => QueryType::PTR,
            DnsRecord::TXT { .. } => QueryType::TXT,
            DnsRecord::UNKNOWN { qtype, .. } => QueryType::UNKNOWN(qtype),
        }
    }

    pub fn get_domain(&self) -> Option<String> {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::AAAA { ref domain, .. }
            | DnsRecord::CNAME { ref domain, .. }
            | DnsRecord::PTR { ref domain, .. }
            | DnsRecord::UNKNOWN { ref domain, .. }
            | DnsRecord::TXT { ref domain, .. } => Some(domain.clone()),
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A { ttl: TransientTtl(ttl), .. }
            | DnsRecord::AAAA { ttl: TransientTtl(ttl), .. }
            | DnsRecord::CNAME { ttl: TransientTtl(ttl), .. }
            | DnsRecord::PTR { ttl: TransientTtl(ttl), .. }
            | DnsRecord::UNKNOWN { ttl: TransientTtl(ttl), .. }
            | DnsRecord::TXT { ttl: TransientTtl(ttl), .. } => ttl,
        }
    }
}

impl PartialEq for DnsRecord {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_form() == other.canonical_form()
    }
}

impl Eq for DnsRecord {}

impl PartialOrd for DnsRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DnsRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_form().cmp(&other.canonical_form())
    }
}

/// The result code of a DNS response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, // Transaction ID

    // Flags
    pub recursion_desired: bool,
    pub truncated_message: bool,
    pub authoritative_answer: bool,
    pub opcode: u8,
    pub response: bool,

    pub rescode: ResultCode,
    pub checking_disabled: bool,
    pub authed_data: bool,
    pub z: bool,
    pub recursion_available: bool,

    // Record counts
    pub questions: u16,
    pub answers: u16,
    pub authoritative_entries: u16,
    pub resource_entries: u16,
}

impl DnsHeader {
    /// Creates a new dns header with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the DNS header to the provided buffer.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        // the flags occupy two bytes
        let flags1 = (self.recursion_desired as u8)
            | ((self.truncated_message as u8) << 1)
            | ((self.authoritative_answer as u8) << 2)
            | (self.opcode << 3)
            | ((self.response as u8) << 7);

        let flags2 = (self.rescode as u8)
            | ((self.checking_disabled as u8) << 4)
            | ((self.authed_data as u8) << 5)
            | ((self.z as u8) << 6)
            | ((self.recursion_available as u8) << 7);

        buffer.write_u8(flags1)?;
        buffer.write_u8(flags2)?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    /// Returns the fixed binary size of the DNS header.
    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let flags1 = (flags >> 8) as u8;
        let flags2 = (flags & 0xFF) as u8;

        self.recursion_desired = (flags1 & (1 << 0)) > 0;
        self.truncated_message = (flags1 & (1 << 1)) > 0;
        self.authoritative_answer = (flags1 & (1 << 2)) > 0;
        self.opcode = (flags1 >> 3) & 0x0F;
        self.response = (flags1 & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(flags2 & 0x0F);
        self.checking_disabled = (flags2 & (1 << 4)) > 0;
        self.authed_data = (flags2 & (1 << 5)) > 0;
        self.z = (flags2 & (1 << 6)) > 0;
        self.recursion_available = (flags2 & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS packet.
///
/// A packet can be read and written in a single operation.
#[derive(Debug, Clone, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    /// Creates a new, empty DNS packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a dns packet from a packet buffer.
    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<Self> {
        let mut packet = Self::new();

        packet.header.read(buffer)?;

        fn read_records<T: PacketBuffer>(
            count: u16,
            buffer: &mut T,
            target: &mut Vec<DnsRecord>,
        ) -> Result<()> {
            for _ in 0..count {
                target.push(DnsRecord::read(buffer)?);
            }

            Ok(())
        }

        for _ in 0..packet.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::UNKNOWN(0));
            question.read(buffer)?;
            packet.questions.push(question);
        }

        read_records(packet.header.answers, buffer, &mut packet.answers)?;
        read_records(
            packet.header.authoritative_entries,
            buffer,
            &mut packet.authorities,
        )?;
        read_records(packet.header.resource_entries, buffer, &mut packet.resources)?;

        Ok(packet)
    }

    /// Writes the DNS packet to a packet buffer with a maximum size,
    /// truncating the record sections when they do not fit.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();
        let mut size = self.header.binary_len();

        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        let mut record_count = 0;
        self.header.answers = 0;
        self.header.authoritative_entries = 0;
        self.header.resource_entries = 0;

        for (i, rec) in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.resources)
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                self.header.truncated_message = true;
                break;
            }

            record_count = i + 1;

            if i < self.answers.len() {
                self.header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                self.header.authoritative_entries += 1;
            } else {
                self.header.resource_entries += 1;
            }
        }

        self.header.questions = self.questions.len() as u16;
        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.resources)
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}
