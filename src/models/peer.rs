pub mod address_state;
pub mod peer_address;
pub mod signal_route;

pub use address_state::AddressState;
pub use address_state::PeerAddressRecord;
pub use peer_address::AddressKey;
pub use peer_address::Endpoint;
pub use peer_address::PeerAddress;
pub use peer_address::Protocol;
pub use peer_address::ProtocolMask;
pub use peer_address::Services;
pub use peer_address::SignalId;
pub use signal_route::SignalRoute;
