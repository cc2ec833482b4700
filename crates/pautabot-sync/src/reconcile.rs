//! Snapshot diffing and ledger deduplication.

use std::collections::HashSet;

use pautabot_core::{NaturalKey, ProcessedPurchase, Purchase, SellerTotals};

/// Sellers worth investigating: present in `new` and either absent from `old` or with a
/// strictly larger total. Order follows `new`. Sellers that dropped or vanished are never
/// selected.
pub fn diff_totals(old: &SellerTotals, new: &SellerTotals) -> Vec<String> {
    let previous = old.as_lookup();
    new.iter()
        .filter(|(seller, amount)| match previous.get(seller) {
            None => true,
            Some(before) => *before < *amount,
        })
        .map(|(seller, _)| seller.to_string())
        .collect()
}

/// Natural keys already accounted for. Built once per cycle and extended as orders are
/// queued or recorded, so one catalog scan per seller stays linear.
#[derive(Debug, Clone, Default)]
pub struct LedgerIndex {
    keys: HashSet<NaturalKey>,
}

impl LedgerIndex {
    pub fn from_ledger(ledger: &[ProcessedPurchase]) -> Self {
        Self {
            keys: ledger.iter().map(ProcessedPurchase::key).collect(),
        }
    }

    pub fn contains(&self, key: NaturalKey) -> bool {
        self.keys.contains(&key)
    }

    /// Returns `false` when the key was already claimed.
    pub fn claim(&mut self, key: NaturalKey) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Catalog entries for `seller` whose key is not in `index`, in catalog order.
pub fn unprocessed_for_seller<'a>(
    catalog: &'a [Purchase],
    index: &LedgerIndex,
    seller: &str,
) -> Vec<&'a Purchase> {
    catalog
        .iter()
        .filter(|purchase| purchase.seller == seller && !index.contains(purchase.key()))
        .collect()
}

/// One-shot form of [`unprocessed_for_seller`] against a raw ledger. Every outcome counts as
/// processed, including `error` and `dropped`.
pub fn unprocessed_purchases<'a>(
    catalog: &'a [Purchase],
    ledger: &[ProcessedPurchase],
    seller: &str,
) -> Vec<&'a Purchase> {
    unprocessed_for_seller(catalog, &LedgerIndex::from_ledger(ledger), seller)
}
