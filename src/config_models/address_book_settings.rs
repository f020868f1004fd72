use std::time::Duration;

use crate::models::peer::peer_address::PeerAddress;
use crate::models::peer::peer_address::Protocol;

/// All tunables of the address book. The defaults are the values the Stratus
/// network runs with; tests shrink the intervals to keep themselves fast.
#[derive(Clone, Debug)]
pub struct AddressBookSettings {
    /// Maximum age of a WebSocket address before it is dropped.
    pub max_age_ws: Duration,
    /// Maximum age of an RTC address. Signal routes go stale much faster than
    /// listening sockets, hence the shorter window.
    pub max_age_rtc: Duration,
    /// Maximum age of a dumb address.
    pub max_age_dumb: Duration,
    /// Maximum accepted WebRTC hop count. Addresses reported from further
    /// away are rejected; `max_distance + 1` doubles as the "no route known"
    /// sentinel.
    pub max_distance: u8,
    pub max_failed_attempts_ws: u32,
    pub max_failed_attempts_rtc: u32,
    /// Tolerated clock skew for gossiped timestamps.
    pub max_timestamp_drift: Duration,
    pub housekeeping_interval: Duration,
    /// Ban duration applied by explicit `ban` calls.
    pub default_ban_time: Duration,
    /// First failure-triggered ban duration; doubles per ban up to
    /// `max_ban_backoff`.
    pub initial_ban_backoff: Duration,
    pub max_ban_backoff: Duration,
    /// How long a record may sit in `Connecting` before the housekeeping
    /// sweep treats the attempt as unreachable.
    pub connecting_timeout: Duration,
    /// Hard-coded bootstrap addresses, injected at construction time.
    pub seed_peers: Vec<PeerAddress>,
}

impl AddressBookSettings {
    pub fn max_age(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Ws => self.max_age_ws,
            Protocol::Rtc => self.max_age_rtc,
            Protocol::Dumb => self.max_age_dumb,
        }
    }
}

impl Default for AddressBookSettings {
    fn default() -> Self {
        Self {
            max_age_ws: Duration::from_secs(60 * 30),
            max_age_rtc: Duration::from_secs(60 * 10),
            max_age_dumb: Duration::from_secs(60),
            max_distance: 4,
            max_failed_attempts_ws: 3,
            max_failed_attempts_rtc: 2,
            max_timestamp_drift: Duration::from_secs(60 * 10),
            housekeeping_interval: Duration::from_secs(60),
            default_ban_time: Duration::from_secs(60 * 10),
            initial_ban_backoff: Duration::from_secs(15),
            max_ban_backoff: Duration::from_secs(60 * 10),
            connecting_timeout: Duration::from_secs(60 * 5),
            seed_peers: vec![
                PeerAddress::seed("seed1.stratus.network", 8443),
                PeerAddress::seed("seed2.stratus.network", 8443),
                PeerAddress::seed("seed3.stratus.network", 8443),
                PeerAddress::seed("seed4.stratus.network", 8443),
                PeerAddress::seed("anchor.stratus.network", 443),
            ],
        }
    }
}
