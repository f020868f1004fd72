use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config_models::address_book_settings::AddressBookSettings;
use crate::models::channel::ChannelId;
use crate::models::peer::peer_address::PeerAddress;
use crate::models::peer::peer_address::Protocol;
use crate::models::peer::signal_route::SignalRoute;

/// Lifecycle state of a known address.
///
/// `Connecting` and `Connected` are transient and revert to `Tried` on
/// disconnect. `Banned` is the only state that is left through the
/// housekeeping sweep rather than through a transport event.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumIs,
)]
pub enum AddressState {
    New,
    Connecting,
    Connected,
    Tried,
    Failed,
    Banned,
}

/// Everything the address book knows about one address: its lifecycle state,
/// failure and backoff bookkeeping, and (for RTC addresses) the known signal
/// routes.
#[derive(Clone, Debug)]
pub struct PeerAddressRecord {
    address: PeerAddress,
    pub(crate) state: AddressState,
    pub(crate) last_connected: Option<u64>,
    pub(crate) banned_until: Option<u64>,
    /// Ban duration that will be applied the next time the failure ceiling is
    /// reached. Doubles on every failure-triggered ban, up to the maximum.
    pub(crate) ban_backoff: Duration,
    /// When the record entered `Connecting`, for the connecting-timeout sweep.
    pub(crate) connecting_since: Option<u64>,
    routes: HashMap<ChannelId, SignalRoute>,
    best_route: Option<ChannelId>,
    /// Failure counter for addresses without routes (WebSocket and dumb
    /// peers). When a best route exists, that route's counter is
    /// authoritative instead; see [`Self::failed_attempts`].
    local_failed_attempts: u32,
}

impl PeerAddressRecord {
    pub fn new(address: PeerAddress, settings: &AddressBookSettings) -> Self {
        Self {
            address,
            state: AddressState::New,
            last_connected: None,
            banned_until: None,
            ban_backoff: settings.initial_ban_backoff,
            connecting_since: None,
            routes: HashMap::new(),
            best_route: None,
            local_failed_attempts: 0,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub(crate) fn address_mut(&mut self) -> &mut PeerAddress {
        &mut self.address
    }

    /// Replace the stored address, then re-derive the hop distance from the
    /// current best route so the stored distance never contradicts the route
    /// set.
    pub(crate) fn set_address(&mut self, address: PeerAddress, settings: &AddressBookSettings) {
        self.address = address;
        if self.address.protocol() == Protocol::Rtc {
            self.sync_distance(settings);
        }
    }

    pub fn state(&self) -> AddressState {
        self.state
    }

    pub fn last_connected(&self) -> Option<u64> {
        self.last_connected
    }

    pub fn banned_until(&self) -> Option<u64> {
        self.banned_until
    }

    /// Failure ceiling for this address's protocol. Dumb addresses cannot be
    /// dialed at all, so their ceiling is zero and a single `unreachable`
    /// report escalates immediately.
    pub fn max_failed_attempts(&self, settings: &AddressBookSettings) -> u32 {
        match self.address.protocol() {
            Protocol::Ws => settings.max_failed_attempts_ws,
            Protocol::Rtc => settings.max_failed_attempts_rtc,
            Protocol::Dumb => 0,
        }
    }

    /// Failed connection attempts for this address. Delegates to the best
    /// route's counter when one exists, so failures are tracked per route for
    /// RTC peers.
    pub fn failed_attempts(&self) -> u32 {
        match self.best_route() {
            Some(route) => route.failed_attempts,
            None => self.local_failed_attempts,
        }
    }

    /// Counterpart of [`Self::failed_attempts`]. Writing through to the best
    /// route changes that route's score, so the best route is re-evaluated
    /// afterwards.
    pub(crate) fn set_failed_attempts(&mut self, value: u32, settings: &AddressBookSettings) {
        match self.best_route {
            Some(channel) => {
                if let Some(route) = self.routes.get_mut(&channel) {
                    route.failed_attempts = value;
                }
                self.update_best_route(settings);
            }
            None => self.local_failed_attempts = value,
        }
    }

    pub fn best_route(&self) -> Option<&SignalRoute> {
        self.best_route.and_then(|channel| self.routes.get(&channel))
    }

    pub fn has_route(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Register or refresh the route through `channel`. A refreshed route
    /// keeps the failure history it had accumulated via this channel.
    pub(crate) fn add_route(
        &mut self,
        channel: ChannelId,
        distance: u8,
        timestamp: u64,
        settings: &AddressBookSettings,
    ) {
        let mut route = SignalRoute::new(channel, distance, timestamp);
        if let Some(old_route) = self.routes.get(&channel) {
            route.failed_attempts = old_route.failed_attempts;
        }

        let replaces_best = match self.best_route() {
            None => true,
            Some(best) => {
                let score = route.score(settings);
                let best_score = best.score(settings);
                score > best_score || (score == best_score && timestamp > best.timestamp)
            }
        };

        let refreshed_best = self.best_route == Some(channel);
        self.routes.insert(channel, route);

        if replaces_best {
            self.best_route = Some(channel);
            self.address.set_distance(distance);
        } else if refreshed_best {
            // The best route itself was refreshed with a worse score; another
            // route may now be the best one.
            self.update_best_route(settings);
        }
    }

    pub(crate) fn delete_route(&mut self, channel: ChannelId, settings: &AddressBookSettings) {
        self.routes.remove(&channel);
        if self.best_route == Some(channel) {
            self.update_best_route(settings);
        }
    }

    pub(crate) fn delete_best_route(&mut self, settings: &AddressBookSettings) {
        if let Some(channel) = self.best_route {
            self.delete_route(channel, settings);
        }
    }

    pub(crate) fn delete_all_routes(&mut self, settings: &AddressBookSettings) {
        self.routes.clear();
        self.best_route = None;
        self.address.set_distance(settings.max_distance + 1);
    }

    /// Refresh the address (and best-route) timestamp of a connected peer;
    /// an open connection is itself evidence of freshness.
    pub(crate) fn refresh_timestamp(&mut self, now_ms: u64) {
        self.address.timestamp = now_ms;
        if let Some(channel) = self.best_route {
            if let Some(route) = self.routes.get_mut(&channel) {
                route.timestamp = now_ms;
            }
        }
    }

    /// Pick the highest-scoring route as the new best route, ties broken by
    /// the newest timestamp, and mirror its distance into the address. With
    /// no routes left, the distance becomes the unreachable sentinel
    /// `max_distance + 1`.
    fn update_best_route(&mut self, settings: &AddressBookSettings) {
        let mut best: Option<(ChannelId, f64, u64, u8)> = None;
        for route in self.routes.values() {
            let score = route.score(settings);
            let replaces = match best {
                None => true,
                Some((_, best_score, best_timestamp, _)) => {
                    score > best_score || (score == best_score && route.timestamp > best_timestamp)
                }
            };
            if replaces {
                best = Some((route.channel(), score, route.timestamp, route.distance()));
            }
        }

        match best {
            Some((channel, _, _, distance)) => {
                self.best_route = Some(channel);
                self.address.set_distance(distance);
            }
            None => {
                self.best_route = None;
                self.address.set_distance(settings.max_distance + 1);
            }
        }
    }

    fn sync_distance(&mut self, settings: &AddressBookSettings) {
        match self.best_route().map(SignalRoute::distance) {
            Some(distance) => self.address.set_distance(distance),
            None => self.address.set_distance(settings.max_distance + 1),
        }
    }
}
