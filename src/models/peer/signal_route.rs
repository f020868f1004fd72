use crate::config_models::address_book_settings::AddressBookSettings;
use crate::models::channel::ChannelId;

/// One way of reaching an RTC peer: signaling messages are relayed through
/// the connected peer identified by `channel`. A peer can have several routes
/// at once, one per relaying channel.
#[derive(Clone, Debug)]
pub struct SignalRoute {
    channel: ChannelId,
    distance: u8,
    /// Freshness of the route, in milliseconds since the epoch.
    pub timestamp: u64,
    /// Connection attempts that failed specifically via this route.
    pub failed_attempts: u32,
}

impl SignalRoute {
    pub fn new(channel: ChannelId, distance: u8, timestamp: u64) -> Self {
        Self {
            channel,
            distance,
            timestamp,
            failed_attempts: 0,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn distance(&self) -> u8 {
        self.distance
    }

    /// Shorter and less-failed routes win. The score decays linearly with the
    /// failed attempts and reaches 0 at the RTC failure ceiling.
    pub fn score(&self, settings: &AddressBookSettings) -> f64 {
        let proximity = (settings.max_distance as f64 - self.distance as f64) / 2.0;
        let reliability =
            1.0 - self.failed_attempts as f64 / settings.max_failed_attempts_rtc as f64;
        proximity * reliability
    }
}
