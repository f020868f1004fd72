pub mod housekeeping;
mod scorer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::warn;

use crate::config_models::address_book_settings::AddressBookSettings;
use crate::config_models::network_config::unix_now_ms;
use crate::config_models::network_config::NetworkConfig;
use crate::models::channel::AddressBookEvent;
use crate::models::channel::ChannelId;
use crate::models::peer::address_state::AddressState;
use crate::models::peer::address_state::PeerAddressRecord;
use crate::models::peer::peer_address::AddressKey;
use crate::models::peer::peer_address::PeerAddress;
use crate::models::peer::peer_address::Protocol;
use crate::models::peer::peer_address::ProtocolMask;
use crate::models::peer::peer_address::Services;
use crate::models::peer::peer_address::SignalId;

/// Upper bound on scored candidates per `pick_address` call, so picking stays
/// cheap on large books.
const MAX_PICK_CANDIDATES: usize = 1000;

/// Default cap on addresses returned by `query`.
pub const MAX_QUERY_ADDRESSES: usize = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The address book behind a single lock. All operations run to completion
/// under the lock and none of them blocks, so event callbacks, the dial
/// scheduler, and the housekeeping task can share one book.
pub type SharedAddressBook = Arc<Mutex<AddressBook>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AddressBookError {
    #[error("connecting to banned address {0}")]
    ConnectingToBanned(PeerAddress),

    #[error("duplicate connection to {0}")]
    DuplicateConnection(PeerAddress),

    #[error("connected to banned address {0}")]
    ConnectedToBanned(PeerAddress),
}

/// The peer address directory: every address this node has learned about,
/// its lifecycle state, and the signal routes for reaching RTC peers.
///
/// The book performs no I/O. The transport layer reports lifecycle events
/// into it (`connecting`, `connected`, `disconnected`, `unreachable`,
/// `unroutable`), gossip feeds it via `add`, and the dial scheduler consumes
/// `pick_address` and the connection counters.
#[derive(Debug)]
pub struct AddressBook {
    store: HashMap<AddressKey, PeerAddressRecord>,
    /// Secondary index for routing signaling messages; covers every RTC
    /// record in `store`.
    signal_index: HashMap<SignalId, AddressKey>,
    ws_connected: usize,
    rtc_connected: usize,
    dumb_connected: usize,
    /// Outbound connection attempts currently in flight.
    connecting_count: usize,
    network_config: NetworkConfig,
    settings: AddressBookSettings,
    event_tx: broadcast::Sender<AddressBookEvent>,

    #[cfg(test)]
    mock_now: Option<u64>,
}

impl AddressBook {
    pub fn new(network_config: NetworkConfig, settings: AddressBookSettings) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut book = Self {
            store: HashMap::new(),
            signal_index: HashMap::new(),
            ws_connected: 0,
            rtc_connected: 0,
            dumb_connected: 0,
            connecting_count: 0,
            network_config,
            settings,
            event_tx,
            #[cfg(test)]
            mock_now: None,
        };
        let seeds = book.settings.seed_peers.clone();
        book.add(None, seeds);
        book
    }

    /// Allows for mocked timestamps such that time dependencies may be tested.
    #[cfg(test)]
    fn with_mocked_time(mut self, mocked_time: u64) -> Self {
        self.mock_now = Some(mocked_time);
        self
    }

    fn now_ms(&self) -> u64 {
        #[cfg(test)]
        if let Some(now) = self.mock_now {
            return now;
        }
        unix_now_ms()
    }

    /// Subscribe to [`AddressBookEvent`] notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AddressBookEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &AddressBookSettings {
        &self.settings
    }

    pub fn network_config(&self) -> &NetworkConfig {
        &self.network_config
    }

    /// Number of known addresses, including banned and seed entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.ws_connected + self.rtc_connected + self.dumb_connected
    }

    pub fn peer_count_ws(&self) -> usize {
        self.ws_connected
    }

    pub fn peer_count_rtc(&self) -> usize {
        self.rtc_connected
    }

    pub fn peer_count_dumb(&self) -> usize {
        self.dumb_connected
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting_count
    }

    /// The stored copy of `address`, if known.
    pub fn get(&self, address: &PeerAddress) -> Option<&PeerAddress> {
        self.store
            .get(&address.key())
            .map(PeerAddressRecord::address)
    }

    pub fn get_by_signal_id(&self, signal_id: SignalId) -> Option<&PeerAddress> {
        self.signal_index
            .get(&signal_id)
            .and_then(|key| self.store.get(key))
            .map(PeerAddressRecord::address)
    }

    /// The relay channel a signaling message for `signal_id` should be sent
    /// through: the peer's current best route.
    pub fn channel_by_signal_id(&self, signal_id: SignalId) -> Option<ChannelId> {
        self.signal_index
            .get(&signal_id)
            .and_then(|key| self.store.get(key))
            .and_then(|record| record.best_route())
            .map(|route| route.channel())
    }

    pub fn is_connected(&self, address: &PeerAddress) -> bool {
        self.store
            .get(&address.key())
            .is_some_and(|record| record.state.is_connected())
    }

    /// Whether `address` is currently banned. Seed addresses are never
    /// reported banned: an internal ban only keeps a down seed from being
    /// picked, it must not block the seed's inbound reconnection.
    pub fn is_banned(&self, address: &PeerAddress) -> bool {
        self.store
            .get(&address.key())
            .is_some_and(|record| record.state.is_banned() && !record.address().is_seed())
    }

    /// Choose the best currently dialable address, or `None` if nothing
    /// qualifies. Scans up to [`MAX_PICK_CANDIDATES`] selectable entries from
    /// a random starting point, so large books stay cheap to pick from and
    /// insertion order carries no bias.
    pub fn pick_address(&self) -> Option<PeerAddress> {
        let records: Vec<&PeerAddressRecord> = self.store.values().collect();
        if records.is_empty() {
            return None;
        }
        let now = self.now_ms();
        let start = rand::rng().random_range(0..records.len());
        let max_candidates = records.len().min(MAX_PICK_CANDIDATES);

        let mut winner: Option<(f64, &PeerAddressRecord)> = None;
        let mut candidates = 0;
        for offset in 0..records.len() {
            let record = records[(start + offset) % records.len()];
            let Some(score) = scorer::score_address(
                record,
                self.ws_connected,
                &self.network_config,
                &self.settings,
                now,
            ) else {
                continue;
            };
            candidates += 1;
            if winner.map_or(true, |(best_score, _)| score > best_score) {
                winner = Some((score, record));
            }
            if candidates >= max_candidates {
                break;
            }
        }

        winner.map(|(_, record)| record.address().clone())
    }

    /// Addresses worth gossiping to other peers: not banned or failing, not
    /// seeds, matching both masks, and not beyond their maximum age. Entries
    /// that are currently connected get their timestamp refreshed first; an
    /// open connection is itself evidence of freshness.
    pub fn query(
        &mut self,
        protocol_mask: ProtocolMask,
        service_mask: Services,
        max_addresses: usize,
    ) -> Vec<PeerAddress> {
        let now = self.now_ms();
        let settings = &self.settings;
        let mut addresses = Vec::new();
        for record in self.store.values_mut() {
            if record.state.is_banned() || record.state.is_failed() {
                continue;
            }
            if record.address().is_seed() {
                continue;
            }
            if !protocol_mask.contains(record.address().protocol()) {
                continue;
            }
            if !record.address().services.intersects(service_mask) {
                continue;
            }
            if record.state.is_connected() {
                record.refresh_timestamp(now);
            }
            if record.address().exceeds_age(now, settings) {
                continue;
            }
            addresses.push(record.address().clone());
            if addresses.len() >= max_addresses {
                break;
            }
        }
        addresses
    }

    /// Learn addresses from `channel` (or from trusted seed injection when
    /// `channel` is `None`, which bypasses the age check). Fires one
    /// [`AddressBookEvent::Added`] carrying exactly the newly admitted
    /// subset, if any.
    pub fn add(
        &mut self,
        channel: Option<ChannelId>,
        addresses: impl IntoIterator<Item = PeerAddress>,
    ) {
        let mut admitted = Vec::new();
        for address in addresses {
            if let Some(address) = self.admit(channel, address) {
                admitted.push(address);
            }
        }
        if !admitted.is_empty() {
            // Nobody listening is fine; gossip is best-effort.
            let _ = self.event_tx.send(AddressBookEvent::Added(admitted));
        }
    }

    /// Run the admission policy for one address. Returns the stored address
    /// on admission, `None` on any rejection.
    fn admit(&mut self, channel: Option<ChannelId>, mut address: PeerAddress) -> Option<PeerAddress> {
        let now = self.now_ms();

        if address.key() == self.network_config.own_address().key() {
            return None;
        }

        // Gossiped addresses must be reasonably fresh; `None` marks trusted
        // seed injection.
        if channel.is_some() && address.exceeds_age(now, &self.settings) {
            debug!("Ignoring address {} - too old", address);
            return None;
        }

        if address.timestamp > now + self.settings.max_timestamp_drift.as_millis() as u64 {
            debug!("Ignoring address {} - timestamp in the future", address);
            return None;
        }

        // The address is one more hop away than the relay that reported it.
        if let Some(distance) = address.distance() {
            let incremented = distance.saturating_add(1);
            address.set_distance(incremented);

            if incremented > self.settings.max_distance {
                debug!("Ignoring address {} - max distance exceeded", address);
                // Drop any route to this peer over the reporting channel.
                // This may prevent signaling loops.
                if let Some(channel) = channel {
                    let key = address.key();
                    let now_routeless = match self.store.get_mut(&key) {
                        Some(record) => {
                            record.delete_route(channel, &self.settings);
                            !record.has_route()
                        }
                        None => false,
                    };
                    if now_routeless {
                        self.remove(&key);
                    }
                }
                return None;
            }
        }

        let key = address.key();
        if self.store.contains_key(&key) {
            let record = self.store.get_mut(&key).expect("checked above");
            if record.state.is_banned() {
                return None;
            }

            // Seeds never get a real timestamp.
            if record.address().is_seed() {
                address.timestamp = 0;
            }

            // Never erase a known net address.
            if record.address().net_address.is_some() && address.net_address.is_none() {
                address.net_address = record.address().net_address;
            }

            // No timestamp regression for WebSocket addresses.
            if address.protocol() == Protocol::Ws && record.address().timestamp >= address.timestamp
            {
                return None;
            }
        } else {
            let record = PeerAddressRecord::new(address.clone(), &self.settings);
            if let Some(signal_id) = address.signal_id() {
                self.signal_index.insert(signal_id, key.clone());
            }
            self.store.insert(key.clone(), record);
        }

        let record = self
            .store
            .get_mut(&key)
            .expect("record exists after admission checks");

        if let (Some(channel), Some(distance)) = (channel, address.distance()) {
            record.add_route(channel, distance, address.timestamp, &self.settings);
        }

        // While connected, the stored address is authoritative; only a
        // previously unknown net address may be filled in.
        if record.state.is_connected() {
            if record.address().net_address.is_none() && address.net_address.is_some() {
                record.address_mut().net_address = address.net_address;
            }
            return None;
        }

        record.set_address(address, &self.settings);
        Some(record.address().clone())
    }

    /// Called when an outbound connection to `address` is being established.
    pub fn connecting(&mut self, address: &PeerAddress) -> Result<(), AddressBookError> {
        let now = self.now_ms();
        let Some(record) = self.store.get_mut(&address.key()) else {
            return Ok(());
        };
        match record.state {
            AddressState::Banned => Err(AddressBookError::ConnectingToBanned(address.clone())),
            AddressState::Connected => Err(AddressBookError::DuplicateConnection(address.clone())),
            state => {
                if state != AddressState::Connecting {
                    self.connecting_count += 1;
                }
                record.state = AddressState::Connecting;
                record.connecting_since = Some(now);
                Ok(())
            }
        }
    }

    /// Called when a connection to `address` has been established. The
    /// connection may have been initiated by the remote peer, so the address
    /// is not necessarily known yet. For RTC peers, `channel` is the
    /// signaling relay the connection was negotiated through.
    pub fn connected(
        &mut self,
        channel: Option<ChannelId>,
        address: &PeerAddress,
    ) -> Result<(), AddressBookError> {
        let now = self.now_ms();
        let key = address.key();
        let mut address = address.clone();

        match self.store.get(&key) {
            None => {
                let record = PeerAddressRecord::new(address.clone(), &self.settings);
                if let Some(signal_id) = address.signal_id() {
                    self.signal_index.insert(signal_id, key.clone());
                }
                self.store.insert(key.clone(), record);
            }
            Some(record) if record.address().is_seed() => {
                address.timestamp = 0;
            }
            Some(_) => {}
        }

        let record = self.store.get_mut(&key).expect("record just ensured");

        // A banned seed may still recover through an inbound connection.
        if record.state.is_banned() && !record.address().is_seed() {
            return Err(AddressBookError::ConnectedToBanned(address));
        }

        let prior_state = record.state;
        record.state = AddressState::Connected;
        record.last_connected = Some(now);
        record.connecting_since = None;
        record.set_failed_attempts(0, &self.settings);
        record.ban_backoff = self.settings.initial_ban_backoff;
        record.set_address(address, &self.settings);
        record.address_mut().timestamp = now;

        let route_info = record
            .address()
            .distance()
            .map(|distance| (distance, record.address().timestamp));
        if let (Some(channel), Some((distance, timestamp))) = (channel, route_info) {
            record.add_route(channel, distance, timestamp, &self.settings);
        }
        let protocol = record.address().protocol();

        if prior_state == AddressState::Connecting {
            self.connecting_count = self.connecting_count.saturating_sub(1);
        }
        if prior_state != AddressState::Connected {
            self.update_connected_count(protocol, 1);
        }
        Ok(())
    }

    /// Called when the connection to `address` over `channel` is closed.
    /// Peers that were signalable only through the closed channel become
    /// unreachable and are dropped.
    pub fn disconnected(
        &mut self,
        channel: Option<ChannelId>,
        address: &PeerAddress,
        closed_by_remote: bool,
    ) {
        let key = address.key();
        if !self.store.contains_key(&key) {
            return;
        }

        if let Some(channel) = channel {
            self.remove_by_signal_channel(channel);
        }

        let Some(record) = self.store.get_mut(&key) else {
            // The route purge above already dropped this record and settled
            // the counters.
            return;
        };
        if record.state.is_banned() {
            return;
        }

        let prior_state = record.state;
        let protocol = record.address().protocol();
        record.state = AddressState::Tried;

        if prior_state == AddressState::Connecting {
            self.connecting_count = self.connecting_count.saturating_sub(1);
        }
        if prior_state == AddressState::Connected {
            self.update_connected_count(protocol, -1);
        }

        // A remote close means the peer does not want us back right now, and
        // dumb peers cannot be dialed again anyway: delete immediately
        // instead of waiting for the sweep.
        if closed_by_remote || protocol == Protocol::Dumb {
            self.remove(&key);
        }
    }

    /// Called when a connection attempt to `address` has failed. Repeated
    /// failures escalate to a ban with doubling backoff; once the backoff is
    /// exhausted the address is dropped for good.
    pub fn unreachable(&mut self, address: &PeerAddress) {
        let key = address.key();
        let Some(record) = self.store.get_mut(&key) else {
            return;
        };
        if record.state.is_banned() {
            return;
        }
        if record.state.is_connecting() {
            self.connecting_count = self.connecting_count.saturating_sub(1);
        }

        record.state = AddressState::Failed;
        let bumped = record.failed_attempts() + 1;
        record.set_failed_attempts(bumped, &self.settings);

        if record.failed_attempts() < record.max_failed_attempts(&self.settings) {
            return;
        }

        let backoff = record.ban_backoff;
        if backoff >= self.settings.max_ban_backoff {
            self.remove(&key);
        } else {
            self.ban(address, backoff);
            if let Some(record) = self.store.get_mut(&key) {
                record.ban_backoff = (backoff * 2).min(self.settings.max_ban_backoff);
            }
        }
    }

    /// Called when a signaling message for `address` came back as
    /// undeliverable from `channel`. Reports about anything but the current
    /// best route are stale and ignored.
    pub fn unroutable(&mut self, channel: ChannelId, address: &PeerAddress) {
        let key = address.key();
        let Some(record) = self.store.get_mut(&key) else {
            return;
        };

        let is_best = record
            .best_route()
            .is_some_and(|route| route.channel() == channel);
        if !is_best {
            warn!(
                "Got unroutable for {} on a channel other than the best route",
                address
            );
            return;
        }

        record.delete_best_route(&self.settings);
        if !record.has_route() {
            self.remove(&key);
        }
    }

    /// Ban `address` for `duration`. Creates the record if the address was
    /// unknown. All signal routes are dropped; a banned peer must not be
    /// relayed through.
    pub fn ban(&mut self, address: &PeerAddress, duration: Duration) {
        let now = self.now_ms();
        let key = address.key();
        debug!(
            "Banning {} for {}",
            address,
            humantime::format_duration(duration)
        );
        if !self.store.contains_key(&key) {
            let record = PeerAddressRecord::new(address.clone(), &self.settings);
            if let Some(signal_id) = address.signal_id() {
                self.signal_index.insert(signal_id, key.clone());
            }
            self.store.insert(key.clone(), record);
        }

        let record = self.store.get_mut(&key).expect("record just ensured");
        let prior_state = record.state;
        let protocol = record.address().protocol();
        record.state = AddressState::Banned;
        record.banned_until = Some(now + duration.as_millis() as u64);
        record.delete_all_routes(&self.settings);

        if prior_state == AddressState::Connecting {
            self.connecting_count = self.connecting_count.saturating_sub(1);
        }
        if prior_state == AddressState::Connected {
            self.update_connected_count(protocol, -1);
        }
    }

    /// One housekeeping sweep: age out stale records, lift expired bans, keep
    /// connected entries fresh, and time out connection attempts the
    /// transport never reported back on. Fires one `Added` event for all
    /// addresses restored from ban.
    pub fn housekeeping(&mut self) {
        let now = self.now_ms();
        let connecting_timeout_ms = self.settings.connecting_timeout.as_millis() as u64;
        let settings = &self.settings;

        let mut unbanned = Vec::new();
        let mut aged_out = Vec::new();
        let mut expired_bans = Vec::new();
        let mut stuck_connecting = Vec::new();

        for (key, record) in self.store.iter_mut() {
            match record.state {
                AddressState::New | AddressState::Tried | AddressState::Failed => {
                    if record.address().exceeds_age(now, settings) {
                        debug!("Deleting old peer address {}", record.address());
                        aged_out.push(key.clone());
                    }
                }
                AddressState::Banned => {
                    if record.banned_until.is_some_and(|until| until <= now) {
                        // A ban that came from the failure ceiling (or hit a
                        // seed) gets another chance; a fixed-duration ban
                        // without failure history is deleted outright.
                        if record.failed_attempts() >= record.max_failed_attempts(settings)
                            || record.address().is_seed()
                        {
                            record.state = AddressState::New;
                            record.set_failed_attempts(0, settings);
                            record.banned_until = None;
                            unbanned.push(record.address().clone());
                        } else {
                            expired_bans.push(key.clone());
                        }
                    }
                }
                AddressState::Connected => {
                    // Keep live peers from aging out.
                    record.refresh_timestamp(now);
                }
                AddressState::Connecting => {
                    if record
                        .connecting_since
                        .is_some_and(|since| since + connecting_timeout_ms <= now)
                    {
                        stuck_connecting.push(record.address().clone());
                    }
                }
            }
        }

        for key in &aged_out {
            self.remove(key);
        }
        for key in &expired_bans {
            self.purge(key);
        }
        for address in &stuck_connecting {
            warn!("Connection attempt to {} timed out", address);
            self.unreachable(address);
        }

        if !unbanned.is_empty() {
            let _ = self.event_tx.send(AddressBookEvent::Added(unbanned));
        }
    }

    /// Remove a record, honoring the retention rules: seeds are re-banned
    /// for their current backoff instead of deleted, and banned records are
    /// kept until their ban expires.
    fn remove(&mut self, key: &AddressKey) {
        let Some(record) = self.store.get(key) else {
            return;
        };
        if record.state.is_banned() {
            return;
        }
        if record.address().is_seed() {
            let address = record.address().clone();
            let backoff = record.ban_backoff;
            self.ban(&address, backoff);
            return;
        }

        let state = record.state;
        let protocol = record.address().protocol();
        let signal_id = record.address().signal_id();

        if state == AddressState::Connecting {
            self.connecting_count = self.connecting_count.saturating_sub(1);
        }
        if state == AddressState::Connected {
            self.update_connected_count(protocol, -1);
        }
        if let Some(signal_id) = signal_id {
            self.signal_index.remove(&signal_id);
        }
        self.store.remove(key);
    }

    /// Unconditionally delete a record, used for expired bans only.
    fn purge(&mut self, key: &AddressKey) {
        if let Some(record) = self.store.remove(key) {
            if let Some(signal_id) = record.address().signal_id() {
                self.signal_index.remove(&signal_id);
            }
        }
    }

    /// Drop every signal route that went through `channel` and remove the RTC
    /// records that are left without any route.
    fn remove_by_signal_channel(&mut self, channel: ChannelId) {
        let settings = &self.settings;
        let mut routeless = Vec::new();
        for (key, record) in self.store.iter_mut() {
            if record.address().protocol() != Protocol::Rtc {
                continue;
            }
            record.delete_route(channel, settings);
            if !record.has_route() {
                routeless.push(key.clone());
            }
        }
        for key in &routeless {
            self.remove(key);
        }
    }

    fn update_connected_count(&mut self, protocol: Protocol, delta: isize) {
        let counter = match protocol {
            Protocol::Ws => &mut self.ws_connected,
            Protocol::Rtc => &mut self.rtc_connected,
            Protocol::Dumb => &mut self.dumb_connected,
        };
        *counter = counter.saturating_add_signed(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn no_seed_settings() -> AddressBookSettings {
        AddressBookSettings {
            seed_peers: vec![],
            ..Default::default()
        }
    }

    fn ws_book() -> AddressBook {
        AddressBook::new(
            NetworkConfig::websocket("self.stratus.network", 8443, Services::FULL),
            no_seed_settings(),
        )
        .with_mocked_time(NOW)
    }

    fn rtc_book() -> AddressBook {
        AddressBook::new(
            NetworkConfig::webrtc(SignalId(0xa11ce), Services::FULL),
            no_seed_settings(),
        )
        .with_mocked_time(NOW)
    }

    fn ws_addr(host: &str, timestamp: u64) -> PeerAddress {
        PeerAddress::new_ws(host, 8443, Services::FULL, timestamp)
    }

    fn rtc_addr(signal_id: u128, distance: u8, timestamp: u64) -> PeerAddress {
        PeerAddress::new_rtc(SignalId(signal_id), distance, Services::FULL, timestamp)
    }

    fn advance_time(book: &mut AddressBook, by_ms: u64) {
        let now = book.now_ms();
        book.mock_now = Some(now + by_ms);
    }

    #[test]
    fn seed_connect_lifecycle() {
        let seed = PeerAddress::seed("seed1.stratus.network", 8443);
        let settings = AddressBookSettings {
            seed_peers: vec![seed.clone()],
            ..Default::default()
        };
        let mut book = AddressBook::new(
            NetworkConfig::websocket("self.stratus.network", 8443, Services::FULL),
            settings,
        )
        .with_mocked_time(NOW);

        assert!(book.get(&seed).is_some());
        assert_eq!(1, book.len());

        book.connecting(&seed).unwrap();
        assert_eq!(1, book.connecting_count());

        book.connected(None, &seed).unwrap();
        assert!(book.is_connected(&seed));
        assert_eq!(1, book.peer_count());
        assert_eq!(1, book.peer_count_ws());
        assert_eq!(0, book.connecting_count());
    }

    #[test]
    fn repeated_add_keeps_one_record() {
        let mut book = ws_book();
        for i in 0..5u64 {
            book.add(Some(ChannelId(1)), [ws_addr("node.example.com", NOW - 5_000 + i)]);
        }
        assert_eq!(1, book.len());
    }

    #[test]
    fn own_address_is_rejected() {
        let mut book = ws_book();
        book.add(Some(ChannelId(1)), [ws_addr("self.stratus.network", NOW)]);
        assert_eq!(0, book.len());
    }

    #[test]
    fn stale_ws_update_is_rejected() {
        let mut book = ws_book();
        let current = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [current.clone()]);

        // Older and equal timestamps do not regress the stored address.
        book.add(Some(ChannelId(1)), [ws_addr("node.example.com", NOW - 2_000)]);
        book.add(Some(ChannelId(1)), [ws_addr("node.example.com", NOW - 1_000)]);
        assert_eq!(NOW - 1_000, book.get(&current).unwrap().timestamp);
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let mut book = ws_book();
        let drift = book.settings.max_timestamp_drift.as_millis() as u64;
        book.add(Some(ChannelId(1)), [ws_addr("node.example.com", NOW + drift + 1_000)]);
        assert_eq!(0, book.len());
    }

    #[test]
    fn aged_address_rejected_from_gossip_but_not_from_seed_injection() {
        let mut book = ws_book();
        let max_age = book.settings.max_age_ws.as_millis() as u64;
        let old = ws_addr("node.example.com", NOW - max_age - 1_000);

        book.add(Some(ChannelId(1)), [old.clone()]);
        assert_eq!(0, book.len());

        book.add(None, [old]);
        assert_eq!(1, book.len());
    }

    #[test]
    fn rtc_admission_increments_distance_and_registers_route() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 1, NOW - 1_000);
        book.add(Some(ChannelId(3)), [addr.clone()]);

        let stored = book.get(&addr).unwrap();
        assert_eq!(Some(2), stored.distance());
        assert!(book.get_by_signal_id(SignalId(7)).is_some());
        assert_eq!(Some(ChannelId(3)), book.channel_by_signal_id(SignalId(7)));
    }

    #[test]
    fn relay_loop_is_rejected_beyond_max_distance() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 2, NOW - 1_000);
        book.add(Some(ChannelId(3)), [addr.clone()]);
        assert_eq!(1, book.len());

        // Reported again at the maximum distance via the same channel: the
        // incremented distance exceeds the cap, and the reporting channel's
        // route is dropped, leaving the record routeless.
        for _ in 0..3 {
            book.add(Some(ChannelId(3)), [rtc_addr(7, 4, NOW)]);
            assert!(book.get(&addr).is_none());
            assert!(book.get_by_signal_id(SignalId(7)).is_none());
        }
    }

    #[test]
    fn best_route_switches_on_closer_report() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 2, NOW - 2_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        assert_eq!(Some(3), book.get(&addr).unwrap().distance());

        book.add(Some(ChannelId(2)), [rtc_addr(7, 0, NOW - 1_000)]);
        assert_eq!(Some(ChannelId(2)), book.channel_by_signal_id(SignalId(7)));
        assert_eq!(Some(1), book.get(&addr).unwrap().distance());
    }

    #[test]
    fn banned_address_is_not_readmitted() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 2_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.ban(&addr, Duration::from_secs(600));

        book.add(Some(ChannelId(1)), [ws_addr("node.example.com", NOW - 1_000)]);
        assert!(book.is_banned(&addr));
        assert_eq!(NOW - 2_000, book.get(&addr).unwrap().timestamp);
    }

    #[test]
    fn known_net_address_is_preserved() {
        let mut book = ws_book();
        let mut with_ip = ws_addr("node.example.com", NOW - 2_000);
        with_ip.net_address = Some("192.0.2.7".parse().unwrap());
        book.add(Some(ChannelId(1)), [with_ip.clone()]);

        book.add(Some(ChannelId(1)), [ws_addr("node.example.com", NOW - 1_000)]);
        let stored = book.get(&with_ip).unwrap();
        assert_eq!(NOW - 1_000, stored.timestamp);
        assert_eq!(Some("192.0.2.7".parse().unwrap()), stored.net_address);
    }

    #[test]
    fn connected_record_only_accepts_net_address_fill_in() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 2_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connected(None, &addr).unwrap();
        assert_eq!(NOW, book.get(&addr).unwrap().timestamp);

        let mut events = book.subscribe();
        let mut update = ws_addr("node.example.com", NOW + 1_000);
        update.net_address = Some("192.0.2.9".parse().unwrap());
        book.add(Some(ChannelId(1)), [update]);

        let stored = book.get(&addr).unwrap();
        assert_eq!(NOW, stored.timestamp, "connected peers keep their stamp");
        assert_eq!(Some("192.0.2.9".parse().unwrap()), stored.net_address);
        assert!(events.try_recv().is_err(), "no admission, no event");
    }

    #[test]
    fn connecting_to_banned_address_fails() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.ban(&addr, Duration::from_secs(600));

        let result = book.connecting(&addr);
        assert!(matches!(
            result,
            Err(AddressBookError::ConnectingToBanned(_))
        ));
        assert_eq!(0, book.connecting_count());
    }

    #[test]
    fn connecting_twice_counts_once() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);

        book.connecting(&addr).unwrap();
        book.connecting(&addr).unwrap();
        assert_eq!(1, book.connecting_count());
    }

    #[test]
    fn connecting_to_connected_address_fails() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connected(None, &addr).unwrap();

        let result = book.connecting(&addr);
        assert!(matches!(
            result,
            Err(AddressBookError::DuplicateConnection(_))
        ));
    }

    #[test]
    fn connecting_to_unknown_address_is_a_noop() {
        let mut book = ws_book();
        book.connecting(&ws_addr("node.example.com", NOW)).unwrap();
        assert_eq!(0, book.connecting_count());
        assert_eq!(0, book.len());
    }

    #[test]
    fn inbound_connection_creates_record() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.connected(None, &addr).unwrap();

        assert!(book.is_connected(&addr));
        assert_eq!(1, book.peer_count());
    }

    #[test]
    fn connected_to_banned_address_fails_unless_seed() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.ban(&addr, Duration::from_secs(600));

        let result = book.connected(None, &addr);
        assert!(matches!(result, Err(AddressBookError::ConnectedToBanned(_))));
        assert_eq!(0, book.peer_count());

        // A banned seed may recover through an inbound connection.
        let seed = PeerAddress::seed("seed1.stratus.network", 8443);
        let settings = AddressBookSettings {
            seed_peers: vec![seed.clone()],
            ..Default::default()
        };
        let mut book = AddressBook::new(
            NetworkConfig::websocket("self.stratus.network", 8443, Services::FULL),
            settings,
        )
        .with_mocked_time(NOW);
        book.ban(&seed, Duration::from_secs(600));
        book.connected(None, &seed).unwrap();
        assert!(book.is_connected(&seed));
        assert_eq!(1, book.peer_count());
    }

    #[test]
    fn disconnect_reverts_to_tried() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connected(None, &addr).unwrap();

        book.disconnected(None, &addr, false);
        assert!(!book.is_connected(&addr));
        assert_eq!(0, book.peer_count());
        assert!(book.get(&addr).is_some());
        assert_eq!(
            AddressState::Tried,
            book.store.get(&addr.key()).unwrap().state
        );
    }

    #[test]
    fn remote_close_removes_record() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connected(None, &addr).unwrap();

        book.disconnected(None, &addr, true);
        assert!(book.get(&addr).is_none());
        assert_eq!(0, book.peer_count());
    }

    #[test]
    fn dumb_peer_is_removed_on_any_disconnect() {
        let mut book = ws_book();
        let addr = PeerAddress::new_dumb(42, Services::NANO, NOW - 1_000);
        book.connected(None, &addr).unwrap();
        assert_eq!(1, book.peer_count_dumb());

        book.disconnected(None, &addr, false);
        assert!(book.get(&addr).is_none());
        assert_eq!(0, book.peer_count_dumb());
    }

    #[test]
    fn disconnect_purges_routes_through_closed_channel() {
        let mut book = rtc_book();
        let relay = ws_addr("relay.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [relay.clone()]);
        book.connected(None, &relay).unwrap();

        // Peer 7 is only signalable via the relay's channel; peer 8 has a
        // fallback route through channel 5.
        book.add(
            Some(ChannelId(9)),
            [rtc_addr(7, 1, NOW - 1_000), rtc_addr(8, 1, NOW - 1_000)],
        );
        book.add(Some(ChannelId(5)), [rtc_addr(8, 2, NOW - 500)]);

        book.disconnected(Some(ChannelId(9)), &relay, false);
        assert!(book.get_by_signal_id(SignalId(7)).is_none());
        assert!(book.get_by_signal_id(SignalId(8)).is_some());
        assert_eq!(Some(ChannelId(5)), book.channel_by_signal_id(SignalId(8)));
        assert_eq!(Some(3), book.get(&rtc_addr(8, 0, 0)).unwrap().distance());
    }

    #[test]
    fn unreachable_escalates_to_ban_with_backoff() {
        let mut book = ws_book();
        let addr = ws_addr("flaky.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);

        book.unreachable(&addr);
        book.unreachable(&addr);
        assert!(!book.is_banned(&addr));
        assert_eq!(
            AddressState::Failed,
            book.store.get(&addr.key()).unwrap().state
        );

        book.unreachable(&addr);
        assert!(book.is_banned(&addr));
        let record = book.store.get(&addr.key()).unwrap();
        assert_eq!(Some(NOW + 15_000), record.banned_until);
        assert_eq!(Duration::from_secs(30), record.ban_backoff);
    }

    #[test]
    fn exhausted_backoff_removes_address() {
        let settings = AddressBookSettings {
            initial_ban_backoff: Duration::from_secs(15),
            max_ban_backoff: Duration::from_secs(15),
            seed_peers: vec![],
            ..Default::default()
        };
        let mut book = AddressBook::new(
            NetworkConfig::websocket("self.stratus.network", 8443, Services::FULL),
            settings,
        )
        .with_mocked_time(NOW);

        let addr = ws_addr("flaky.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        for _ in 0..3 {
            book.unreachable(&addr);
        }
        assert!(book.get(&addr).is_none());
    }

    #[test]
    fn seeds_survive_unreachable_exhaustion() {
        let seed = PeerAddress::seed("seed1.stratus.network", 8443);
        let settings = AddressBookSettings {
            initial_ban_backoff: Duration::from_secs(15),
            max_ban_backoff: Duration::from_secs(15),
            seed_peers: vec![seed.clone()],
            ..Default::default()
        };
        let mut book = AddressBook::new(
            NetworkConfig::websocket("self.stratus.network", 8443, Services::FULL),
            settings,
        )
        .with_mocked_time(NOW);

        for round in 0..3 {
            for _ in 0..3 {
                book.unreachable(&seed);
            }
            assert!(
                book.get(&seed).is_some(),
                "seed must survive failure exhaustion (round {round})"
            );
            assert!(!book.is_banned(&seed), "seeds are never reported banned");
            assert_eq!(
                AddressState::Banned,
                book.store.get(&seed.key()).unwrap().state
            );

            // The expired ban restores the seed for the next round.
            advance_time(&mut book, 16_000);
            book.housekeeping();
            assert_eq!(
                AddressState::New,
                book.store.get(&seed.key()).unwrap().state
            );
        }
    }

    #[test]
    fn ban_is_idempotent_on_counters() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connected(None, &addr).unwrap();
        assert_eq!(1, book.peer_count_ws());

        book.ban(&addr, Duration::from_secs(60));
        assert_eq!(0, book.peer_count_ws());

        book.ban(&addr, Duration::from_secs(120));
        assert_eq!(0, book.peer_count_ws());
        assert_eq!(
            Some(NOW + 120_000),
            book.store.get(&addr.key()).unwrap().banned_until,
            "a repeated ban replaces the expiry"
        );
    }

    #[test]
    fn banning_unknown_rtc_address_creates_indexed_record() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 2, NOW - 1_000);
        book.ban(&addr, Duration::from_secs(60));

        assert!(book.is_banned(&addr));
        assert!(book.get_by_signal_id(SignalId(7)).is_some());
        assert_eq!(None, book.channel_by_signal_id(SignalId(7)));
    }

    #[test]
    fn ban_drops_all_routes() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 1, NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.add(Some(ChannelId(2)), [rtc_addr(7, 2, NOW - 500)]);
        assert!(book.channel_by_signal_id(SignalId(7)).is_some());

        book.ban(&addr, Duration::from_secs(60));
        assert_eq!(None, book.channel_by_signal_id(SignalId(7)));
        let settings = no_seed_settings();
        assert_eq!(
            Some(settings.max_distance + 1),
            book.get(&addr).unwrap().distance(),
            "routeless record carries the unreachable sentinel"
        );
    }

    #[test]
    fn expired_failure_ban_restores_expired_manual_ban_deletes() {
        let mut book = ws_book();
        let failing = ws_addr("flaky.example.com", NOW - 1_000);
        let misbehaving = ws_addr("rogue.example.com", NOW - 1_000);
        book.add(
            Some(ChannelId(1)),
            [failing.clone(), misbehaving.clone()],
        );

        for _ in 0..3 {
            book.unreachable(&failing);
        }
        book.ban(&misbehaving, Duration::from_secs(600));

        let mut events = book.subscribe();
        advance_time(&mut book, 601_000);
        book.housekeeping();

        assert!(book.get(&failing).is_some());
        assert!(!book.is_banned(&failing));
        assert!(book.get(&misbehaving).is_none());

        match events.try_recv() {
            Ok(AddressBookEvent::Added(addresses)) => {
                assert_eq!(1, addresses.len());
                assert_eq!(failing.key(), addresses[0].key());
            }
            other => panic!("expected Added event, got {other:?}"),
        }
    }

    #[test]
    fn housekeeping_ages_out_stale_records() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);

        let max_age = book.settings.max_age_ws.as_millis() as u64;
        advance_time(&mut book, max_age + 2_000);
        book.housekeeping();
        assert!(book.get(&addr).is_none());
    }

    #[test]
    fn housekeeping_keeps_connected_peers_fresh() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 1, NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        let stored = book.get(&addr).unwrap().clone();
        book.connected(Some(ChannelId(1)), &stored).unwrap();

        let max_age = book.settings.max_age_rtc.as_millis() as u64;
        for _ in 0..3 {
            advance_time(&mut book, max_age / 2);
            book.housekeeping();
        }

        let stored = book.get(&addr).unwrap();
        assert_eq!(book.mock_now.unwrap(), stored.timestamp);
        let record = book.store.get(&addr.key()).unwrap();
        assert_eq!(
            book.mock_now.unwrap(),
            record.best_route().unwrap().timestamp
        );
    }

    #[test]
    fn housekeeping_times_out_stuck_connecting_attempts() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connecting(&addr).unwrap();
        assert_eq!(1, book.connecting_count());

        let timeout = book.settings.connecting_timeout.as_millis() as u64;
        advance_time(&mut book, timeout + 1_000);
        book.housekeeping();

        assert_eq!(0, book.connecting_count());
        let record = book.store.get(&addr.key()).unwrap();
        assert_eq!(AddressState::Failed, record.state);
        assert_eq!(1, record.failed_attempts());
    }

    #[test]
    fn query_excludes_banned_failed_and_seed_addresses() {
        let seed = PeerAddress::seed("seed1.stratus.network", 8443);
        let settings = AddressBookSettings {
            seed_peers: vec![seed],
            ..Default::default()
        };
        let mut book = AddressBook::new(
            NetworkConfig::websocket("self.stratus.network", 8443, Services::FULL),
            settings,
        )
        .with_mocked_time(NOW);

        let good = ws_addr("good.example.com", NOW - 1_000);
        let failing = ws_addr("flaky.example.com", NOW - 1_000);
        let banned = ws_addr("rogue.example.com", NOW - 1_000);
        book.add(
            Some(ChannelId(1)),
            [good.clone(), failing.clone(), banned.clone()],
        );
        book.unreachable(&failing);
        book.ban(&banned, Duration::from_secs(600));

        let result = book.query(ProtocolMask::ALL, Services::FULL, MAX_QUERY_ADDRESSES);
        assert_eq!(1, result.len());
        assert_eq!(good.key(), result[0].key());
    }

    #[test]
    fn query_respects_protocol_and_service_masks() {
        let mut book = rtc_book();
        book.add(
            Some(ChannelId(1)),
            [
                ws_addr("node.example.com", NOW - 1_000),
                rtc_addr(7, 1, NOW - 1_000),
            ],
        );
        let nano_only = PeerAddress::new_dumb(42, Services::NANO, NOW - 1_000);
        book.add(Some(ChannelId(1)), [nano_only]);

        let ws_only = book.query(ProtocolMask::WS, Services::FULL, MAX_QUERY_ADDRESSES);
        assert_eq!(1, ws_only.len());
        assert_eq!(Protocol::Ws, ws_only[0].protocol());

        let full_serving = book.query(ProtocolMask::ALL, Services::FULL, MAX_QUERY_ADDRESSES);
        assert_eq!(2, full_serving.len());

        let everything = book.query(
            ProtocolMask::ALL,
            Services::FULL | Services::NANO,
            MAX_QUERY_ADDRESSES,
        );
        assert_eq!(3, everything.len());
    }

    #[test]
    fn query_refreshes_connected_entries() {
        let mut book = ws_book();
        let addr = ws_addr("node.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.connected(None, &addr).unwrap();

        advance_time(&mut book, 60_000);
        let result = book.query(ProtocolMask::ALL, Services::FULL, MAX_QUERY_ADDRESSES);
        assert_eq!(1, result.len());
        assert_eq!(NOW + 60_000, result[0].timestamp);
    }

    #[test]
    fn query_caps_result_count() {
        let mut book = ws_book();
        for i in 0..10u64 {
            book.add(
                Some(ChannelId(1)),
                [ws_addr(&format!("node{i}.example.com"), NOW - 1_000)],
            );
        }
        assert_eq!(4, book.query(ProtocolMask::ALL, Services::FULL, 4).len());
    }

    #[test]
    fn pick_address_returns_none_on_empty_book() {
        let book = ws_book();
        assert_eq!(None, book.pick_address());
    }

    #[test]
    fn pick_address_skips_unselectable_states() {
        let mut book = ws_book();
        let connected = ws_addr("connected.example.com", NOW - 1_000);
        let banned = ws_addr("banned.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [connected.clone(), banned.clone()]);
        book.connected(None, &connected).unwrap();
        book.ban(&banned, Duration::from_secs(600));

        assert_eq!(None, book.pick_address());
    }

    #[test]
    fn pick_address_prefers_websocket_during_bootstrap() {
        let mut book = rtc_book();
        book.add(
            Some(ChannelId(1)),
            [
                ws_addr("node.example.com", NOW - 1_000),
                rtc_addr(7, 1, NOW - 1_000),
            ],
        );

        let picked = book.pick_address().unwrap();
        assert_eq!(Protocol::Ws, picked.protocol());
    }

    #[test]
    fn pick_address_prefers_rtc_once_websocket_links_are_up() {
        let mut book = rtc_book();
        let ws_one = ws_addr("one.example.com", NOW - 1_000);
        let ws_two = ws_addr("two.example.com", NOW - 1_000);
        book.add(Some(ChannelId(1)), [ws_one.clone(), ws_two.clone()]);
        book.connected(None, &ws_one).unwrap();
        book.connected(None, &ws_two).unwrap();

        book.add(
            Some(ChannelId(1)),
            [
                ws_addr("three.example.com", NOW - 1_000),
                rtc_addr(7, 1, NOW - 1_000),
            ],
        );

        let picked = book.pick_address().unwrap();
        assert_eq!(Protocol::Rtc, picked.protocol());
    }

    #[test]
    fn pick_address_respects_protocol_support() {
        let mut book = ws_book();
        book.add(Some(ChannelId(1)), [rtc_addr(7, 1, NOW - 1_000)]);
        assert_eq!(
            None,
            book.pick_address(),
            "a node without WebRTC must not pick RTC addresses"
        );
    }

    #[test]
    fn unroutable_ignores_stale_reports() {
        let mut book = rtc_book();
        let addr = rtc_addr(7, 1, NOW - 1_000);
        book.add(Some(ChannelId(1)), [addr.clone()]);
        book.add(Some(ChannelId(2)), [rtc_addr(7, 3, NOW - 500)]);
        assert_eq!(Some(ChannelId(1)), book.channel_by_signal_id(SignalId(7)));

        // Channel 2 is not the best route: the report is stale.
        book.unroutable(ChannelId(2), &addr);
        assert_eq!(Some(ChannelId(1)), book.channel_by_signal_id(SignalId(7)));

        book.unroutable(ChannelId(1), &addr);
        assert_eq!(Some(ChannelId(2)), book.channel_by_signal_id(SignalId(7)));

        book.unroutable(ChannelId(2), &addr);
        assert!(book.get(&addr).is_none());
        assert!(book.get_by_signal_id(SignalId(7)).is_none());
    }

    #[test]
    fn added_event_carries_exactly_the_admitted_subset() {
        let mut book = ws_book();
        let mut events = book.subscribe();

        let fresh = ws_addr("fresh.example.com", NOW - 1_000);
        let max_age = book.settings.max_age_ws.as_millis() as u64;
        let stale = ws_addr("stale.example.com", NOW - max_age - 1_000);
        book.add(Some(ChannelId(1)), [fresh.clone(), stale]);

        match events.try_recv() {
            Ok(AddressBookEvent::Added(addresses)) => {
                assert_eq!(1, addresses.len());
                assert_eq!(fresh.key(), addresses[0].key());
            }
            other => panic!("expected Added event, got {other:?}"),
        }

        // A rejected update fires no event at all.
        book.add(Some(ChannelId(1)), [ws_addr("fresh.example.com", NOW - 1_000)]);
        assert!(events.try_recv().is_err());
    }
}
