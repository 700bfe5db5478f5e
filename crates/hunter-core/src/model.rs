use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Length of the SHA-256 digests carried in task and notification records.
pub const HASH_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "6")]
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

/// A probe the coordinator wants executed against `target`.
///
/// The admission core only looks at `id` and the address family of `target`;
/// the remaining fields are carried through to the execution subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuntingTask {
    pub id: TaskId,
    pub target: IpAddr,
    pub port: u16,
    pub hostname: String,
    /// Certificate hashes the coordinator already knows for this target.
    #[serde(default)]
    pub known_cert_hashes: Vec<[u8; HASH_LEN]>,
}

impl HuntingTask {
    /// The public address family the client needs to run this task.
    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(&self.target)
    }
}

/// The client's public address as observed by the coordinator.
///
/// `hmac` lets the coordinator later verify that a task reply was produced from
/// this address; the client treats it as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIpNotification {
    pub public_ip: IpAddr,
    pub hmac: [u8; HASH_LEN],
}

impl PublicIpNotification {
    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(&self.public_ip)
    }

    pub fn hmac_hex(&self) -> String {
        hex::encode(self.hmac)
    }
}

/// One decoded entry of a coordinator reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Task(HuntingTask),
    /// Coordinator wall clock, unix seconds.
    CurrentServerTime(i64),
    PublicIpNotification(PublicIpNotification),
    /// A record type this client does not understand. Skipped by length.
    Unknown { kind: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn task_version_follows_target_family() {
        let mut task = HuntingTask {
            id: TaskId(7),
            target: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            port: 443,
            hostname: "example.org".into(),
            known_cert_hashes: vec![],
        };
        assert_eq!(task.ip_version(), IpVersion::V4);
        task.target = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(task.ip_version(), IpVersion::V6);
    }

    #[test]
    fn ip_version_serializes_as_number() {
        assert_eq!(serde_json::to_string(&IpVersion::V6).unwrap(), r#""6""#);
        assert_eq!(IpVersion::V4.to_string(), "IPv4");
    }
}
