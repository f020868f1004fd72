//! Peer address directory of a Stratus node.
//!
//! A Stratus network is made of three kinds of peers: servers reachable over
//! WebSocket, browsers reachable over WebRTC signaling relayed through
//! already-connected peers, and "dumb" clients that cannot be reached at
//! all. The [`AddressBook`] tracks every address this node has learned
//! about, scores candidates for outbound connections, records connection
//! lifecycle events reported by the transport layer, manages the signal
//! routes of RTC peers, and bans addresses that keep failing.
//!
//! The book itself performs no I/O and never blocks; it is meant to live
//! behind a single mutex ([`SharedAddressBook`]) shared by the transport
//! event handlers, the dial scheduler, the gossip responder, and the
//! periodic [`HousekeepingTask`].

pub mod address_book;
pub mod config_models;
pub mod models;

pub use address_book::housekeeping::HousekeepingTask;
pub use address_book::AddressBook;
pub use address_book::AddressBookError;
pub use address_book::SharedAddressBook;
pub use config_models::address_book_settings::AddressBookSettings;
pub use config_models::network_config::NetworkConfig;
pub use models::channel::AddressBookEvent;
pub use models::channel::ChannelId;
pub use models::peer::peer_address::PeerAddress;
pub use models::peer::peer_address::Protocol;
pub use models::peer::peer_address::ProtocolMask;
pub use models::peer::peer_address::Services;
pub use models::peer::peer_address::SignalId;
