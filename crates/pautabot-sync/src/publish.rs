//! Chronological publishing of the eligible queue.

use chrono::Utc;
use pautabot_adapters::{render_notification, Notifier, ProcurementSource};
use pautabot_core::{Outcome, ProcessedPurchase, Purchase};
use tracing::{error, info};

/// Order the queue by purchase date, oldest first. Same-day orders keep discovery order.
pub fn schedule(mut queue: Vec<Purchase>) -> Vec<Purchase> {
    queue.sort_by_key(|purchase| purchase.date);
    queue
}

/// Attempt one notification per queued purchase, strictly in sequence. A failed attempt is
/// recorded as an `error` outcome and the rest of the queue still runs.
pub async fn publish_queue(
    queue: Vec<Purchase>,
    notifier: &dyn Notifier,
    source: &dyn ProcurementSource,
) -> Vec<ProcessedPurchase> {
    let mut recorded = Vec::with_capacity(queue.len());
    for purchase in schedule(queue) {
        recorded.push(publish_one(purchase, notifier, source).await);
    }
    recorded
}

pub async fn publish_one(
    purchase: Purchase,
    notifier: &dyn Notifier,
    source: &dyn ProcurementSource,
) -> ProcessedPurchase {
    let key = purchase.key();
    let notification = render_notification(&purchase, &source.detail_url(key));
    let outcome = match notifier.publish(&notification).await {
        Ok(notification_id) => {
            info!(%key, seller = %purchase.seller, %notification_id, "published");
            Outcome::Processed { notification_id }
        }
        Err(err) => {
            error!(%key, seller = %purchase.seller, error = %err, "publish failed");
            Outcome::Error {
                reason: err.to_string(),
            }
        }
    };
    ProcessedPurchase {
        purchase,
        processed_at: Utc::now(),
        outcome,
    }
}
