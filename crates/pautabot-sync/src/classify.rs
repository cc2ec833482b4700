//! Content classification of candidate purchases.

use pautabot_adapters::{ProcurementSource, PurchaseDetail, SourceError};
use pautabot_core::Purchase;

/// Substring that marks a line-item as advertising spend.
pub const ADVERTISING_MARKER: &str = "publicidad";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Eligible,
    Rejected,
}

pub fn classify(detail: &PurchaseDetail) -> Classification {
    let matched = detail
        .line_items
        .iter()
        .any(|item| item.description.to_lowercase().contains(ADVERTISING_MARKER));
    if matched {
        Classification::Eligible
    } else {
        Classification::Rejected
    }
}

/// Fetch the detail of one purchase and classify it. A fetch failure is returned as an
/// error, never folded into [`Classification::Rejected`].
pub async fn investigate(
    source: &dyn ProcurementSource,
    purchase: &Purchase,
) -> Result<Classification, SourceError> {
    let detail = source.fetch_detail(purchase.key()).await?;
    Ok(classify(&detail))
}
