use crate::config_models::address_book_settings::AddressBookSettings;
use crate::config_models::network_config::NetworkConfig;
use crate::models::peer::address_state::AddressState;
use crate::models::peer::address_state::PeerAddressRecord;
use crate::models::peer::peer_address::Endpoint;
use crate::models::peer::peer_address::PeerAddress;
use crate::models::peer::peer_address::Protocol;

/// Rank a record as an outbound-connection candidate. `None` means the
/// address must not be dialed at all: wrong protocol for this node, too old,
/// or in a state that rules out another attempt right now.
///
/// Pure function; picking a candidate must not mutate the book.
pub(crate) fn score_address(
    record: &PeerAddressRecord,
    ws_connected_count: usize,
    network_config: &NetworkConfig,
    settings: &AddressBookSettings,
    now_ms: u64,
) -> Option<f64> {
    let address = record.address();

    if !network_config.can_connect(address.protocol()) {
        return None;
    }
    if address.exceeds_age(now_ms, settings) {
        return None;
    }

    // Fresher addresses score higher across the board.
    let base = protocol_weight(address, ws_connected_count, settings)
        * (address.timestamp as f64 / 1000.0 + 1.0);

    match record.state() {
        AddressState::Connecting | AddressState::Connected | AddressState::Banned => None,
        AddressState::New | AddressState::Tried => Some(base),
        AddressState::Failed => {
            let ceiling = record.max_failed_attempts(settings);
            if ceiling == 0 {
                return None;
            }
            Some((1.0 - record.failed_attempts() as f64 / ceiling as f64) * base)
        }
    }
}

/// Protocol bias: until this node has two WebSocket links it favors direct
/// connections; afterwards it favors RTC peers to spread load away from the
/// server backbone. RTC addresses additionally prefer fewer relay hops.
fn protocol_weight(
    address: &PeerAddress,
    ws_connected_count: usize,
    settings: &AddressBookSettings,
) -> f64 {
    let mut weight = if ws_connected_count < 2 {
        if address.protocol() == Protocol::Ws {
            3.0
        } else {
            1.0
        }
    } else if address.protocol() == Protocol::Rtc {
        3.0
    } else {
        1.0
    };

    if let Endpoint::Rtc { distance, .. } = address.endpoint {
        weight *= 1.0 + (settings.max_distance as f64 - distance as f64) / 2.0;
    }

    weight
}
