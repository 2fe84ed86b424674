//! Per-item price statistics derived from one snapshot.

use ahdb_store::{Listing, SnapshotKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Share of the cheapest units always sampled.
const MIN_SAMPLE: f64 = 0.15;
/// Share of the cheapest units sampled at most.
const MAX_SAMPLE: f64 = 0.30;
/// Sampling stops at the first price jump larger than this factor.
const MAX_JUMP: f64 = 1.2;
/// Samples further than this many standard deviations from the mean are dropped.
const MAX_DEVIATION: f64 = 1.5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStats {
    /// Cheapest per-unit buyout, in copper.
    pub min_buyout: u64,
    /// Units on sale with a buyout.
    pub num_auctions: u64,
    pub market_value: u64,
}

/// Statistics for every item of one snapshot, ordered by item string.
///
/// Summaries are pure functions of the snapshot payload, which makes them
/// safe to cache by fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub key: SnapshotKey,
    pub items: BTreeMap<String, ItemStats>,
}

impl SnapshotSummary {
    pub fn from_listing(listing: &Listing) -> Self {
        let mut prices: BTreeMap<&str, Vec<(u64, u64)>> = BTreeMap::new();
        for auction in &listing.auctions {
            // Bid-only auctions carry no price signal.
            if auction.buyout == 0 {
                continue;
            }
            prices
                .entry(auction.item.as_str())
                .or_default()
                .push((auction.buyout, u64::from(auction.quantity)));
        }
        let items = prices
            .into_iter()
            .map(|(item, mut runs)| {
                runs.sort_unstable();
                let stats = ItemStats {
                    min_buyout: runs.first().map(|(price, _)| *price).unwrap_or_default(),
                    num_auctions: runs.iter().map(|(_, quantity)| quantity).sum(),
                    market_value: market_value(&runs),
                };
                (item.to_string(), stats)
            })
            .collect();
        Self { key: listing.key(), items }
    }

    pub fn timestamp(&self) -> i64 {
        self.key.timestamp
    }
}

/// Market value of an item from `(unit price, quantity)` runs sorted by price.
///
/// Takes at least the cheapest 15% of units and up to 30% while no price
/// exceeds 1.2 times the previous one, drops outliers beyond 1.5 standard
/// deviations, and returns the rounded mean of what is left.
pub fn market_value(runs: &[(u64, u64)]) -> u64 {
    let total: u64 = runs.iter().map(|(_, quantity)| quantity).sum();
    if total == 0 {
        return 0;
    }
    let min_take = ((total as f64 * MIN_SAMPLE).ceil() as u64).max(1);
    let max_take = ((total as f64 * MAX_SAMPLE).floor() as u64).max(min_take);

    let mut samples: Vec<(f64, f64)> = Vec::new();
    let mut taken = 0;
    let mut previous: Option<u64> = None;
    for &(price, quantity) in runs {
        if taken >= max_take {
            break;
        }
        if taken >= min_take && previous.is_some_and(|prev| price as f64 > prev as f64 * MAX_JUMP) {
            break;
        }
        let take = quantity.min(max_take - taken);
        samples.push((price as f64, take as f64));
        taken += take;
        previous = Some(price);
    }

    let count = taken as f64;
    let mean = samples.iter().map(|(price, weight)| price * weight).sum::<f64>() / count;
    let variance = samples.iter().map(|(price, weight)| weight * (price - mean).powi(2)).sum::<f64>() / count;
    let limit = variance.sqrt() * MAX_DEVIATION;

    let (sum, weight) = samples
        .iter()
        .filter(|(price, _)| (price - mean).abs() <= limit)
        .fold((0.0, 0.0), |(sum, total), (price, weight)| (sum + price * weight, total + weight));
    match weight > 0.0 {
        true => (sum / weight).round() as u64,
        false => mean.round() as u64,
    }
}

/// Rounded mean of an item's market value across `summaries`, counting only
/// the snapshots that priced it.
pub fn mean_market_value<'a>(summaries: impl IntoIterator<Item = &'a SnapshotSummary>, item: &str) -> u64 {
    let (sum, count) = summaries
        .into_iter()
        .filter_map(|summary| summary.items.get(item))
        .filter(|stats| stats.market_value > 0)
        .fold((0u128, 0u128), |(sum, count), stats| (sum + u128::from(stats.market_value), count + 1));
    match count {
        0 => 0,
        count => ((sum + count / 2) / count) as u64,
    }
}
