use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{error, info};

use souq_core::identity::Caller;
use souq_order::repository::ReleaseFilter;
use souq_order::SettlementService;

/// Periodic sweep that releases every sub-order whose return window has
/// lapsed. Conflicts are expected: an admin may release by hand between the
/// queue read and the release call, and the store guard makes the loser a
/// no-op.
pub async fn start_release_sweep(settlement: Arc<SettlementService>, interval_seconds: u64) {
    let mut ticker = interval(Duration::from_secs(interval_seconds));
    info!("Release sweep started (every {}s)", interval_seconds);

    loop {
        ticker.tick().await;
        let caller = Caller::system();

        let queue = match settlement.release_queue(&ReleaseFilter::default()).await {
            Ok(queue) => queue,
            Err(e) => {
                error!("Release sweep could not read the queue: {}", e);
                continue;
            }
        };

        for sub in queue {
            match settlement
                .release(
                    sub.id,
                    &caller,
                    Some("automatic release after return window".to_string()),
                )
                .await
            {
                Ok(receipt) => info!(
                    sub_order_id = %sub.id,
                    settle = receipt.breakdown.settle_amount,
                    "swept escrow release"
                ),
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(sub_order_id = %sub.id, "sweep release failed: {}", e),
            }
        }
    }
}
