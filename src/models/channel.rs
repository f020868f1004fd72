use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::models::peer::peer_address::PeerAddress;

/// Identity of one open peer channel. The address book never talks through a
/// channel itself; it only uses the identity for equality checks and as the
/// key under which signal routes are registered.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// Notifications the address book broadcasts to interested tasks, e.g. the
/// gossip task re-announcing freshly learned addresses.
#[derive(Clone, Debug)]
pub enum AddressBookEvent {
    /// Fired once per `add` call and once per housekeeping sweep, carrying
    /// exactly the addresses admitted (or restored from ban) by that call.
    Added(Vec<PeerAddress>),
}
