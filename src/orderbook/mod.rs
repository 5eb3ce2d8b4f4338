//! In-memory mirror of one market side for one asset (spec section 4.2).
//!
//! Numeric semantics: prices and sizes are [`rust_decimal::Decimal`]
//! throughout; floating point never appears in arithmetic that determines
//! arbitrage profitability (spec section 4.2, section 9).
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// A single price/size level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

/// In-memory mirror of one asset's order book. `bids` are conceptually keyed
/// by price descending and `asks` ascending; both are kept as sorted vectors
/// since updates are O(log n) binary-search inserts and best-price lookup is
/// then O(1) (spec section 4.2).
#[derive(Debug, Clone, Default)]
pub struct OrderBookReplica {
    // IndexMap preserves arbitrary insertion, but here we keep it sorted
    // ourselves so that `.first()`/`.last()`-equivalent access stays O(1);
    // price -> size, descending for bids (best first).
    bids: IndexMap<Decimal, Decimal>,
    // price -> size, ascending for asks (best first).
    asks: IndexMap<Decimal, Decimal>,
}

impl OrderBookReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides atomically from a full snapshot (spec section 4.2).
    pub fn apply_snapshot(&mut self, bids: &[Level], asks: &[Level]) {
        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if level.size > Decimal::ZERO {
                self.bids.insert(level.price, level.size);
            }
        }
        for level in asks {
            if level.size > Decimal::ZERO {
                self.asks.insert(level.price, level.size);
            }
        }

        self.sort_bids();
        self.sort_asks();
    }

    /// Insert/update a level when `size > 0`; remove it when `size == 0`. A
    /// delta for an absent level with `size == 0` is a no-op, not an error
    /// (spec section 4.2).
    pub fn apply_delta(&mut self, side: BookSide, price: Decimal, size: Decimal) {
        let map = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        if size > Decimal::ZERO {
            map.insert(price, size);
        } else {
            map.shift_remove(&price);
        }

        match side {
            BookSide::Bid => self.sort_bids(),
            BookSide::Ask => self.sort_asks(),
        }
    }

    fn sort_bids(&mut self) {
        self.bids.sort_by(|a_price, _, b_price, _| b_price.cmp(a_price));
    }

    fn sort_asks(&mut self) {
        self.asks.sort_by(|a_price, _, b_price, _| a_price.cmp(b_price));
    }

    /// Best (highest) bid and its aggregated size. `None` when the side is empty.
    pub fn best_bid(&self) -> Option<Level> {
        self.bids
            .iter()
            .next()
            .map(|(&price, &size)| Level { price, size })
    }

    /// Best (lowest) ask and its aggregated size. `None` when the side is empty.
    pub fn best_ask(&self) -> Option<Level> {
        self.asks
            .iter()
            .next()
            .map(|(&price, &size)| Level { price, size })
    }

    /// Midpoint of best bid and best ask. `None` unless both sides are non-empty.
    pub fn mid(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }

    /// First `n` levels of each side, for diagnostic snapshots.
    pub fn depth(&self, n: usize) -> (Vec<Level>, Vec<Level>) {
        let bids = self
            .bids
            .iter()
            .take(n)
            .map(|(&price, &size)| Level { price, size })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(&price, &size)| Level { price, size })
            .collect();
        (bids, asks)
    }

    /// True when both sides are non-empty and `best_bid < best_ask`, or when
    /// at least one side is empty (the invariant is vacuous in that case).
    pub fn is_consistent(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price < ask.price,
            _ => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn apply_snapshot_is_authoritative() {
        let mut book = OrderBookReplica::new();
        let bids = [Level { price: dec!(0.48), size: dec!(100) }];
        let asks = [Level { price: dec!(0.49), size: dec!(100) }];
        book.apply_snapshot(&bids, &asks);

        book.apply_delta(BookSide::Bid, dec!(0.47), dec!(10));
        book.apply_delta(BookSide::Ask, dec!(0.50), dec!(10));

        book.apply_snapshot(&bids, &asks);
        assert_eq!(book.best_bid().unwrap().price, dec!(0.48));
        assert_eq!(book.best_ask().unwrap().price, dec!(0.49));
        assert_eq!(book.depth(10).0.len(), 1);
        assert_eq!(book.depth(10).1.len(), 1);
    }

    #[test]
    fn delta_idempotence_except_for_zero_size_removal() {
        let mut a = OrderBookReplica::new();
        let mut b = OrderBookReplica::new();

        a.apply_delta(BookSide::Bid, dec!(0.48), dec!(10));
        a.apply_delta(BookSide::Bid, dec!(0.48), dec!(10));

        b.apply_delta(BookSide::Bid, dec!(0.48), dec!(10));

        assert_eq!(a.best_bid(), b.best_bid());

        a.apply_delta(BookSide::Bid, dec!(0.48), dec!(0));
        assert!(a.best_bid().is_none());
    }

    #[test]
    fn zero_size_delta_on_absent_level_is_a_no_op() {
        let mut book = OrderBookReplica::new();
        book.apply_delta(BookSide::Bid, dec!(0.10), dec!(0));
        assert!(book.best_bid().is_none());
        assert!(book.is_consistent());
    }

    #[test]
    fn best_bid_is_below_best_ask_when_both_present() {
        let mut book = OrderBookReplica::new();
        book.apply_delta(BookSide::Bid, dec!(0.48), dec!(100));
        book.apply_delta(BookSide::Ask, dec!(0.49), dec!(100));
        assert!(book.is_consistent());
        assert_eq!(book.mid(), Some(dec!(0.485)));
    }
}
