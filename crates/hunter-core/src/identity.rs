use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::model::IpVersion;

/// Resolution state of one public address slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "addr", rename_all = "snake_case")]
pub enum AddressState {
    /// Not resolved yet in this cycle.
    #[default]
    Unknown,
    Known(IpAddr),
    /// The address family is not usable from this client right now.
    Unsupported,
}

impl AddressState {
    pub fn addr(&self) -> Option<IpAddr> {
        match self {
            AddressState::Known(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, AddressState::Unknown)
    }
}

/// The client's own public addresses for one cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub v4: AddressState,
    pub v6: AddressState,
}

impl PublicIdentity {
    pub fn get(&self, version: IpVersion) -> AddressState {
        match version {
            IpVersion::V4 => self.v4,
            IpVersion::V6 => self.v6,
        }
    }

    pub fn set(&mut self, version: IpVersion, state: AddressState) {
        match version {
            IpVersion::V4 => self.v4 = state,
            IpVersion::V6 => self.v6 = state,
        }
    }

    /// Records an address whose family decides the slot.
    pub fn seed(&mut self, addr: IpAddr) {
        self.set(IpVersion::of(&addr), AddressState::Known(addr));
    }

    /// Addresses usable as history lookup keys. Unsupported slots yield `None`
    /// and therefore never match a stored row.
    pub fn candidates(&self) -> Candidates {
        Candidates {
            v4: self.v4.addr(),
            v6: self.v6.addr(),
        }
    }
}

/// The pair of addresses a history query is restricted to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Candidates {
    pub v4: Option<IpAddr>,
    pub v6: Option<IpAddr>,
}

impl Candidates {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.v4.as_ref() == Some(addr) || self.v6.as_ref() == Some(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.v4.iter().chain(self.v6.iter()).copied()
    }
}

/// The coordinator's own reachable addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorIdentity {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

impl CoordinatorIdentity {
    /// Keeps the first address of each family.
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut identity = Self::default();
        for addr in addrs {
            match addr {
                IpAddr::V4(v4) if identity.v4.is_none() => identity.v4 = Some(v4),
                IpAddr::V6(v6) if identity.v6.is_none() => identity.v6 = Some(v6),
                _ => {}
            }
        }
        identity
    }

    pub fn address(&self, version: IpVersion) -> Option<IpAddr> {
        match version {
            IpVersion::V4 => self.v4.map(IpAddr::V4),
            IpVersion::V6 => self.v6.map(IpAddr::V6),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}
