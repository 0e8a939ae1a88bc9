//! Just enough RFC 1035 to ask "who is `<hostname>`" over mDNS and read
//! the IPv4 address out of whatever comes back
use std::net::Ipv4Addr;
use thiserror::Error;

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
/// mDNS reuses the top bit of the class for cache-flush / unicast-response
const CLASS_MASK: u16 = 0x7fff;
const MAX_POINTER_JUMPS: usize = 16;
const MAX_NAME_LEN: usize = 255;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DnsError {
    #[error("Packet truncated at offset {0}")]
    Truncated(usize),
    #[error("Bad label at offset {0}")]
    BadLabel(usize),
    #[error("Compression pointer loop")]
    PointerLoop,
}

/// Single-question A/IN query
pub fn build_query(id: u16, hostname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + hostname.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // flags: standard query
    packet.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    packet.extend_from_slice(&[0u8; 6]); // an / ns / ar

    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        let label = &label.as_bytes()[..label.len().min(63)];
        packet.push(label.len() as u8);
        packet.extend_from_slice(label);
    }
    packet.push(0);
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

/// Address from the first A record (in any section) owned by
/// `hostname`. Queries and packets answering other names yield
/// `Ok(None)`; packets that cannot be walked yield a [`DnsError`].
pub fn parse_response(packet: &[u8], hostname: &str) -> Result<Option<Ipv4Addr>, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Truncated(packet.len()));
    }
    let flags = read_u16(packet, 2)?;
    if flags & FLAG_RESPONSE == 0 {
        return Ok(None);
    }

    let target = hostname.trim_end_matches('.');
    let questions = read_u16(packet, 4)?;
    let records = [6, 8, 10]
        .iter()
        .map(|offset| read_u16(packet, *offset).map(usize::from))
        .sum::<Result<usize, DnsError>>()?;

    let mut pos = HEADER_LEN;
    for _ in 0..questions {
        let (_, next) = read_name(packet, pos)?;
        pos = next + 4;
        if pos > packet.len() {
            return Err(DnsError::Truncated(pos));
        }
    }

    for _ in 0..records {
        let (name, next) = read_name(packet, pos)?;
        let rtype = read_u16(packet, next)?;
        let class = read_u16(packet, next + 2)?;
        let rdlen = usize::from(read_u16(packet, next + 8)?);
        let rdata = next + 10;
        if rdata + rdlen > packet.len() {
            return Err(DnsError::Truncated(rdata + rdlen));
        }

        if rtype == TYPE_A
            && class & CLASS_MASK == CLASS_IN
            && rdlen == 4
            && name.eq_ignore_ascii_case(target)
        {
            let octets = &packet[rdata..rdata + 4];
            return Ok(Some(Ipv4Addr::new(
                octets[0], octets[1], octets[2], octets[3],
            )));
        }
        pos = rdata + rdlen;
    }

    Ok(None)
}

fn read_u16(packet: &[u8], offset: usize) -> Result<u16, DnsError> {
    match packet.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(DnsError::Truncated(offset)),
    }
}

/// Dotted name starting at `offset` + the offset just past it in the
/// uncompressed stream
fn read_name(packet: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = offset;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos).ok_or(DnsError::Truncated(pos))?;
        match len & 0xc0 {
            0x00 if len == 0 => {
                return Ok((name, end.unwrap_or(pos + 1)));
            }
            0x00 => {
                let start = pos + 1;
                let label = packet
                    .get(start..start + usize::from(len))
                    .ok_or(DnsError::Truncated(start))?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                if name.len() > MAX_NAME_LEN {
                    return Err(DnsError::BadLabel(pos));
                }
                pos = start + usize::from(len);
            }
            0xc0 => {
                let low = *packet.get(pos + 1).ok_or(DnsError::Truncated(pos + 1))?;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DnsError::PointerLoop);
                }
                pos = (usize::from(len & 0x3f) << 8) | usize::from(low);
            }
            _ => return Err(DnsError::BadLabel(pos)),
        }
    }
}
