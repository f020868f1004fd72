use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::models::peer::peer_address::PeerAddress;
use crate::models::peer::peer_address::Protocol;
use crate::models::peer::peer_address::ProtocolMask;
use crate::models::peer::peer_address::Services;
use crate::models::peer::peer_address::SignalId;

/// How this node presents itself on the network: its own address, the
/// services it provides, and which protocols it is able to dial.
///
/// The three constructors correspond to the three kinds of node: a server
/// with a reachable WebSocket endpoint, a WebRTC-capable client, and a client
/// that cannot accept any connection ("dumb").
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    own_address: PeerAddress,
    /// Protocols this node can open outbound connections over.
    dialable: ProtocolMask,
    /// Protocols worth asking other peers about, used to filter gossip.
    protocol_mask: ProtocolMask,
    services: Services,
}

impl NetworkConfig {
    /// A node reachable on a public WebSocket endpoint. Such nodes dial only
    /// WebSocket peers; they have no WebRTC stack.
    pub fn websocket(host: impl Into<String>, port: u16, services: Services) -> Self {
        Self {
            own_address: PeerAddress::new_ws(host, port, services, unix_now_ms()),
            dialable: ProtocolMask::WS,
            protocol_mask: ProtocolMask::WS,
            services,
        }
    }

    /// A WebRTC-capable client, reachable through signaling under
    /// `signal_id`. Dials both WebSocket and RTC peers.
    pub fn webrtc(signal_id: SignalId, services: Services) -> Self {
        Self {
            own_address: PeerAddress::new_rtc(signal_id, 0, services, unix_now_ms()),
            dialable: ProtocolMask::WS | ProtocolMask::RTC,
            protocol_mask: ProtocolMask::WS | ProtocolMask::RTC,
            services,
        }
    }

    /// A client without WebRTC support. It can dial WebSocket peers but
    /// cannot be reached by anyone.
    pub fn dumb(services: Services) -> Self {
        Self {
            own_address: PeerAddress::new_dumb(rand::random(), services, unix_now_ms()),
            dialable: ProtocolMask::WS,
            protocol_mask: ProtocolMask::WS | ProtocolMask::RTC,
            services,
        }
    }

    pub fn own_address(&self) -> &PeerAddress {
        &self.own_address
    }

    /// Whether this node is able to open a connection over `protocol`. Dumb
    /// addresses are never dialable by anyone.
    pub fn can_connect(&self, protocol: Protocol) -> bool {
        protocol != Protocol::Dumb && self.dialable.contains(protocol)
    }

    pub fn protocol_mask(&self) -> ProtocolMask {
        self.protocol_mask
    }

    pub fn services(&self) -> Services {
        self.services
    }
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch")
        .as_millis() as u64
}
