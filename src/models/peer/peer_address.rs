use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;

use serde::Deserialize;
use serde::Serialize;

use crate::config_models::address_book_settings::AddressBookSettings;

/// Transport protocol by which a peer can (or cannot) be reached.
///
/// `Dumb` peers announce themselves but accept no connections at all; they
/// exist so that the rest of the network can account for them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
pub enum Protocol {
    Ws,
    Rtc,
    Dumb,
}

impl Protocol {
    pub const fn bit(self) -> u8 {
        match self {
            Protocol::Ws => 1,
            Protocol::Rtc => 2,
            Protocol::Dumb => 4,
        }
    }
}

/// Set of protocols, used to filter address queries and to describe which
/// protocols this node can dial.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProtocolMask(u8);

impl ProtocolMask {
    pub const NONE: ProtocolMask = ProtocolMask(0);
    pub const WS: ProtocolMask = ProtocolMask(Protocol::Ws.bit());
    pub const RTC: ProtocolMask = ProtocolMask(Protocol::Rtc.bit());
    pub const DUMB: ProtocolMask = ProtocolMask(Protocol::Dumb.bit());
    pub const ALL: ProtocolMask =
        ProtocolMask(Protocol::Ws.bit() | Protocol::Rtc.bit() | Protocol::Dumb.bit());

    pub const fn contains(self, protocol: Protocol) -> bool {
        self.0 & protocol.bit() != 0
    }
}

impl BitOr for ProtocolMask {
    type Output = ProtocolMask;

    fn bitor(self, rhs: ProtocolMask) -> ProtocolMask {
        ProtocolMask(self.0 | rhs.0)
    }
}

impl From<Protocol> for ProtocolMask {
    fn from(protocol: Protocol) -> Self {
        ProtocolMask(protocol.bit())
    }
}

/// Service bits a peer advertises. Peers gossip this mask so that clients can
/// pick peers that serve the data they need.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Services(pub u32);

impl Services {
    pub const NONE: Services = Services(0);
    /// Serves nothing beyond its own transactions.
    pub const NANO: Services = Services(1);
    /// Serves block headers and inclusion proofs.
    pub const LIGHT: Services = Services(2);
    /// Serves full blocks.
    pub const FULL: Services = Services(4);

    pub const fn intersects(self, mask: Services) -> bool {
        self.0 & mask.0 != 0
    }
}

impl BitOr for Services {
    type Output = Services;

    fn bitor(self, rhs: Services) -> Services {
        Services(self.0 | rhs.0)
    }
}

/// Identity under which an RTC peer can be signaled through relaying peers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub u128);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Protocol-specific part of a peer address. The variant also carries the
/// fields that identify the address for store-keying purposes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ws {
        host: String,
        port: u16,
    },
    Rtc {
        signal_id: SignalId,
        /// Hop count to reach the peer through relays. 0 is the peer itself,
        /// 1 a direct connection; anything above 1 passes through relays.
        distance: u8,
    },
    Dumb {
        id: u64,
    },
}

/// Store key of a peer address: host and port for WebSocket peers, the signal
/// id for RTC peers, the announced id for dumb peers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressKey {
    Ws { host: String, port: u16 },
    Rtc(SignalId),
    Dumb(u64),
}

/// A network address of a peer, as learned from gossip, a handshake, or the
/// hard-coded seed list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub services: Services,
    /// Last-seen time in milliseconds since the epoch. Hard-coded seed
    /// addresses carry timestamp 0 and are exempt from aging.
    pub timestamp: u64,
    /// IP the peer was observed under, if any connection ever revealed one.
    pub net_address: Option<IpAddr>,
    pub endpoint: Endpoint,
}

impl PeerAddress {
    pub fn new_ws(host: impl Into<String>, port: u16, services: Services, timestamp: u64) -> Self {
        Self {
            services,
            timestamp,
            net_address: None,
            endpoint: Endpoint::Ws {
                host: host.into(),
                port,
            },
        }
    }

    pub fn new_rtc(signal_id: SignalId, distance: u8, services: Services, timestamp: u64) -> Self {
        Self {
            services,
            timestamp,
            net_address: None,
            endpoint: Endpoint::Rtc {
                signal_id,
                distance,
            },
        }
    }

    pub fn new_dumb(id: u64, services: Services, timestamp: u64) -> Self {
        Self {
            services,
            timestamp,
            net_address: None,
            endpoint: Endpoint::Dumb { id },
        }
    }

    /// A hard-coded bootstrap address. Seeds carry timestamp 0, which marks
    /// them as exempt from aging and permanent deletion.
    pub fn seed(host: impl Into<String>, port: u16) -> Self {
        Self::new_ws(host, port, Services::FULL, 0)
    }

    pub fn protocol(&self) -> Protocol {
        match self.endpoint {
            Endpoint::Ws { .. } => Protocol::Ws,
            Endpoint::Rtc { .. } => Protocol::Rtc,
            Endpoint::Dumb { .. } => Protocol::Dumb,
        }
    }

    pub fn key(&self) -> AddressKey {
        match &self.endpoint {
            Endpoint::Ws { host, port } => AddressKey::Ws {
                host: host.clone(),
                port: *port,
            },
            Endpoint::Rtc { signal_id, .. } => AddressKey::Rtc(*signal_id),
            Endpoint::Dumb { id } => AddressKey::Dumb(*id),
        }
    }

    pub fn is_seed(&self) -> bool {
        self.timestamp == 0
    }

    pub fn signal_id(&self) -> Option<SignalId> {
        match self.endpoint {
            Endpoint::Rtc { signal_id, .. } => Some(signal_id),
            _ => None,
        }
    }

    pub fn distance(&self) -> Option<u8> {
        match self.endpoint {
            Endpoint::Rtc { distance, .. } => Some(distance),
            _ => None,
        }
    }

    /// Overwrite the hop distance. No-op for non-RTC addresses, which have no
    /// notion of distance.
    pub(crate) fn set_distance(&mut self, new_distance: u8) {
        if let Endpoint::Rtc { distance, .. } = &mut self.endpoint {
            *distance = new_distance;
        }
    }

    /// Whether this address is older than the maximum age for its protocol.
    /// Seed addresses never age out.
    pub fn exceeds_age(&self, now_ms: u64, settings: &AddressBookSettings) -> bool {
        if self.is_seed() {
            return false;
        }
        let age_ms = now_ms.saturating_sub(self.timestamp);
        age_ms > settings.max_age(self.protocol()).as_millis() as u64
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Ws { host, port } => write!(f, "ws://{host}:{port}"),
            Endpoint::Rtc {
                signal_id,
                distance,
            } => write!(f, "rtc://{signal_id} (distance {distance})"),
            Endpoint::Dumb { id } => write!(f, "dumb://{id}"),
        }
    }
}
