use tokio::time;
use tracing::debug;

use crate::address_book::SharedAddressBook;

/// Periodic maintenance of a shared [`AddressBook`](crate::AddressBook):
/// ages out stale entries, lifts expired bans, and keeps connected peers
/// fresh.
///
/// The task has no shutdown signal of its own; it runs until the book is
/// torn down. Spawn it with `tokio::spawn` and abort the join handle when
/// shutting the node down.
pub struct HousekeepingTask {
    address_book: SharedAddressBook,
}

impl HousekeepingTask {
    pub fn new(address_book: SharedAddressBook) -> Self {
        Self { address_book }
    }

    pub async fn run(self) {
        let interval = {
            let address_book = self.address_book.lock().unwrap();
            address_book.settings().housekeeping_interval
        };

        // The timer must be reset every time it has run.
        let sweep_timer = time::sleep(interval);
        tokio::pin!(sweep_timer);

        loop {
            sweep_timer.as_mut().await;

            {
                let mut address_book = self.address_book.lock().unwrap();
                address_book.housekeeping();
                debug!(
                    "Address book housekeeping done; {} addresses known",
                    address_book.len()
                );
            }

            sweep_timer
                .as_mut()
                .reset(time::Instant::now() + interval);
        }
    }
}
