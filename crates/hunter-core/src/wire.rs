//! Binary record codec for coordinator replies.
//!
//! A reply is a concatenation of records. Every record starts with a 3-byte
//! header: the record type (`u8`) followed by the total record length
//! including the header (`u16`, big endian).

use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::ids::TaskId;
use crate::model::{HuntingTask, PublicIpNotification, Record, HASH_LEN};

pub const HEADER_LEN: usize = 3;

pub const TYPE_PUBLIC_IP_NOTIF4: u8 = 0;
pub const TYPE_PUBLIC_IP_NOTIF6: u8 = 1;
pub const TYPE_CURRENT_SERVER_TIME: u8 = 2;
pub const TYPE_IPV4_SHA256_TASK: u8 = 5;
pub const TYPE_IPV6_SHA256_TASK: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reply is empty")]
    Empty,
    #[error("record at offset {offset} truncated: declares {declared} bytes, {available} available")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("record at offset {offset} declares length {declared}, shorter than its header")]
    BadLength { offset: usize, declared: usize },
    #[error("record type {kind} at offset {offset} has a malformed {len}-byte payload")]
    BadPayload { kind: u8, offset: usize, len: usize },
    #[error("hostname of task {0} is not valid UTF-8")]
    BadHostname(TaskId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("record of {0} bytes exceeds the u16 length field")]
    TooLong(usize),
    #[error("task {0} carries {1} known hashes, more than a u8 can count")]
    TooManyHashes(TaskId, usize),
}

/// Decodes a whole reply. Unknown record types decode to [`Record::Unknown`].
pub fn decode_records(bytes: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let available = bytes.len() - offset;
        if available < HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset,
                declared: HEADER_LEN,
                available,
            });
        }
        let mut header = &bytes[offset..offset + HEADER_LEN];
        let kind = header.read_u8().map_err(|_| DecodeError::Empty)?;
        let declared = header.read_u16::<BigEndian>().map_err(|_| DecodeError::Empty)? as usize;
        if declared < HEADER_LEN {
            return Err(DecodeError::BadLength { offset, declared });
        }
        if declared > available {
            return Err(DecodeError::Truncated {
                offset,
                declared,
                available,
            });
        }

        let payload = &bytes[offset + HEADER_LEN..offset + declared];
        records.push(decode_record(kind, payload, offset)?);
        offset += declared;
    }
    Ok(records)
}

fn decode_record(kind: u8, payload: &[u8], offset: usize) -> Result<Record, DecodeError> {
    let bad = || DecodeError::BadPayload {
        kind,
        offset,
        len: payload.len(),
    };
    let mut rdr = Cursor::new(payload);

    let record = match kind {
        TYPE_PUBLIC_IP_NOTIF4 | TYPE_PUBLIC_IP_NOTIF6 => {
            let addr_len = if kind == TYPE_PUBLIC_IP_NOTIF4 { 4 } else { 16 };
            if payload.len() != HASH_LEN + addr_len {
                return Err(bad());
            }
            let mut hmac = [0u8; HASH_LEN];
            rdr.read_exact(&mut hmac).map_err(|_| bad())?;
            let public_ip = read_addr(&mut rdr, addr_len).map_err(|_| bad())?;
            Record::PublicIpNotification(PublicIpNotification { public_ip, hmac })
        }
        TYPE_CURRENT_SERVER_TIME => {
            if payload.len() != 4 {
                return Err(bad());
            }
            Record::CurrentServerTime(rdr.read_u32::<BigEndian>().map_err(|_| bad())? as i64)
        }
        TYPE_IPV4_SHA256_TASK | TYPE_IPV6_SHA256_TASK => {
            let addr_len = if kind == TYPE_IPV4_SHA256_TASK { 4 } else { 16 };
            let id = TaskId(rdr.read_u32::<BigEndian>().map_err(|_| bad())?);
            let hash_count = rdr.read_u8().map_err(|_| bad())? as usize;
            let target = read_addr(&mut rdr, addr_len).map_err(|_| bad())?;
            let port = rdr.read_u16::<BigEndian>().map_err(|_| bad())?;

            let mut known_cert_hashes = Vec::with_capacity(hash_count);
            for _ in 0..hash_count {
                let mut hash = [0u8; HASH_LEN];
                rdr.read_exact(&mut hash).map_err(|_| bad())?;
                known_cert_hashes.push(hash);
            }

            let mut host = Vec::new();
            rdr.read_to_end(&mut host).map_err(|_| bad())?;
            let hostname = String::from_utf8(host).map_err(|_| DecodeError::BadHostname(id))?;

            Record::Task(HuntingTask {
                id,
                target,
                port,
                hostname,
                known_cert_hashes,
            })
        }
        other => Record::Unknown { kind: other },
    };
    Ok(record)
}

fn read_addr(rdr: &mut Cursor<&[u8]>, len: usize) -> std::io::Result<IpAddr> {
    if len == 4 {
        let mut octets = [0u8; 4];
        rdr.read_exact(&mut octets)?;
        Ok(IpAddr::V4(Ipv4Addr::from(octets)))
    } else {
        let mut octets = [0u8; 16];
        rdr.read_exact(&mut octets)?;
        Ok(IpAddr::V6(Ipv6Addr::from(octets)))
    }
}

/// Encodes records in coordinator format. `Record::Unknown` becomes a bare
/// header.
pub fn encode_records(records: &[Record]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    for record in records {
        let (kind, payload) = encode_payload(record)?;
        let total = payload.len() + HEADER_LEN;
        let len = u16::try_from(total).map_err(|_| EncodeError::TooLong(total))?;
        // Writes into a Vec cannot fail.
        let _ = out.write_u8(kind);
        let _ = out.write_u16::<BigEndian>(len);
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

fn encode_payload(record: &Record) -> Result<(u8, Vec<u8>), EncodeError> {
    let mut p = Vec::new();
    let kind = match record {
        Record::PublicIpNotification(n) => {
            p.extend_from_slice(&n.hmac);
            push_addr(&mut p, &n.public_ip);
            match n.public_ip {
                IpAddr::V4(_) => TYPE_PUBLIC_IP_NOTIF4,
                IpAddr::V6(_) => TYPE_PUBLIC_IP_NOTIF6,
            }
        }
        Record::CurrentServerTime(t) => {
            let _ = p.write_u32::<BigEndian>(*t as u32);
            TYPE_CURRENT_SERVER_TIME
        }
        Record::Task(task) => {
            let count = u8::try_from(task.known_cert_hashes.len())
                .map_err(|_| EncodeError::TooManyHashes(task.id, task.known_cert_hashes.len()))?;
            let _ = p.write_u32::<BigEndian>(task.id.0);
            let _ = p.write_u8(count);
            push_addr(&mut p, &task.target);
            let _ = p.write_u16::<BigEndian>(task.port);
            for hash in &task.known_cert_hashes {
                p.extend_from_slice(hash);
            }
            p.extend_from_slice(task.hostname.as_bytes());
            match task.target {
                IpAddr::V4(_) => TYPE_IPV4_SHA256_TASK,
                IpAddr::V6(_) => TYPE_IPV6_SHA256_TASK,
            }
        }
        Record::Unknown { kind } => *kind,
    };
    Ok((kind, p))
}

fn push_addr(out: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u32, target: &str) -> HuntingTask {
        HuntingTask {
            id: TaskId(id),
            target: target.parse().unwrap(),
            port: 443,
            hostname: "www.example.org".into(),
            known_cert_hashes: vec![[0xab; HASH_LEN]],
        }
    }

    #[test]
    fn decodes_a_full_task_list_reply() {
        let records = vec![
            Record::PublicIpNotification(PublicIpNotification {
                public_ip: "198.51.100.4".parse().unwrap(),
                hmac: [7; HASH_LEN],
            }),
            Record::CurrentServerTime(1_700_000_000),
            Record::Task(task(1, "192.0.2.10")),
            Record::Task(task(2, "2001:db8::10")),
        ];
        let bytes = encode_records(&records).unwrap();
        assert_eq!(decode_records(&bytes).unwrap(), records);
    }

    #[test]
    fn task_record_layout() {
        let bytes = encode_records(&[Record::Task(HuntingTask {
            id: TaskId(0x01020304),
            target: "192.0.2.1".parse().unwrap(),
            port: 8443,
            hostname: "a".into(),
            known_cert_hashes: vec![],
        })])
        .unwrap();
        assert_eq!(
            bytes,
            vec![
                TYPE_IPV4_SHA256_TASK, 0, 15, // header
                1, 2, 3, 4, // task id
                0, // hash count
                192, 0, 2, 1, // target
                0x20, 0xfb, // port
                b'a',
            ]
        );
    }

    #[test]
    fn unknown_kind_is_skipped_by_length() {
        let mut bytes = vec![42, 0, 6, 0xde, 0xad, 0xbe];
        bytes.extend(encode_records(&[Record::CurrentServerTime(9)]).unwrap());
        assert_eq!(
            decode_records(&bytes).unwrap(),
            vec![Record::Unknown { kind: 42 }, Record::CurrentServerTime(9)]
        );
    }

    #[test]
    fn empty_reply_is_an_error() {
        assert_eq!(decode_records(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn truncated_and_malformed_records_are_rejected() {
        assert!(matches!(
            decode_records(&[TYPE_CURRENT_SERVER_TIME, 0, 7, 0, 0]),
            Err(DecodeError::Truncated { offset: 0, declared: 7, available: 5 })
        ));
        assert!(matches!(
            decode_records(&[TYPE_CURRENT_SERVER_TIME, 0, 1]),
            Err(DecodeError::BadLength { declared: 1, .. })
        ));
        assert!(matches!(
            decode_records(&[TYPE_CURRENT_SERVER_TIME, 0, 5, 0, 0]),
            Err(DecodeError::BadPayload { kind: TYPE_CURRENT_SERVER_TIME, .. })
        ));
        assert!(matches!(
            decode_records(&[1, 2]),
            Err(DecodeError::Truncated { declared: HEADER_LEN, .. })
        ));
    }

    #[test]
    fn non_utf8_hostname_is_rejected() {
        let mut bytes = encode_records(&[Record::Task(HuntingTask {
            id: TaskId(3),
            target: "192.0.2.1".parse().unwrap(),
            port: 443,
            hostname: "x".into(),
            known_cert_hashes: vec![],
        })])
        .unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0xff;
        assert_eq!(decode_records(&bytes), Err(DecodeError::BadHostname(TaskId(3))));
    }
}
