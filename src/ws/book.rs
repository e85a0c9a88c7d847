use crate::core::types::{LevelDelta, PriceLevel, ProductSymbol};

/// Incrementally maintained L2 order book for one symbol.
///
/// Invariant: within each side the levels are unique by price and sorted
/// ascending by numeric price. A delta with size zero removes the level at
/// that exact price. Snapshots replace the book wholesale.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub symbol: ProductSymbol,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn new(symbol: ProductSymbol) -> Self {
        Self {
            symbol,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Replace the book wholesale from a snapshot message.
    pub fn apply_snapshot(&mut self, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) {
        self.bids = bids;
        self.asks = asks;
        sort_side(&mut self.bids);
        sort_side(&mut self.asks);
    }

    /// Apply one update message's deltas to both sides, then verify the
    /// supplied checksum if any. Returns `false` when the checksum was
    /// present and did not match the reconstructed top of book.
    pub fn apply_update(
        &mut self,
        bids: &[LevelDelta],
        asks: &[LevelDelta],
        checksum: Option<u32>,
    ) -> bool {
        apply_side(&mut self.bids, bids);
        apply_side(&mut self.asks, asks);
        checksum.map_or(true, |cs| self.checksum() == cs)
    }

    /// CRC32 over the top ten levels of each side in the exchange's
    /// integrity-check format: asks block first, every field joined by `:`.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(self.checksum_input().as_bytes())
    }

    fn checksum_input(&self) -> String {
        format!("{}:{}", side_block(&self.asks), side_block(&self.bids))
    }
}

fn side_block(levels: &[PriceLevel]) -> String {
    levels
        .iter()
        .take(10)
        .map(|l| format!("{}:{}", l.price, l.size))
        .collect::<Vec<_>>()
        .join(":")
}

fn apply_side(levels: &mut Vec<PriceLevel>, deltas: &[LevelDelta]) {
    for delta in deltas {
        let price = delta.price();
        let size = delta.size();
        let existing = levels.iter().position(|l| l.price == price);
        if size.is_zero() {
            if let Some(index) = existing {
                levels.remove(index);
            }
        } else if let Some(index) = existing {
            levels[index].size = size;
        } else {
            levels.push(PriceLevel::new(price, size));
        }
    }
    sort_side(levels);
}

fn sort_side(levels: &mut [PriceLevel]) {
    levels.sort_by(|a, b| a.price.cmp(&b.price));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn decimal(s: &str) -> Decimal {
        s.parse().expect("literal decimal")
    }

    fn level(price: &str, size: &str) -> PriceLevel {
        PriceLevel::new(decimal(price), decimal(size))
    }

    fn delta(price: &str, size: &str) -> LevelDelta {
        LevelDelta(decimal(price), decimal(size))
    }

    fn book_with_bids(bids: Vec<PriceLevel>) -> OrderBook {
        let mut book = OrderBook::new(ProductSymbol::from("BTCUSD"));
        book.apply_snapshot(bids, vec![]);
        book
    }

    #[test]
    fn test_zero_size_removes_and_new_price_inserts() {
        let mut book = book_with_bids(vec![level("100", "1"), level("99", "2")]);

        let ok = book.apply_update(&[delta("99", "0"), delta("98", "5")], &[], None);
        assert!(ok);
        assert_eq!(book.bids, vec![level("98", "5"), level("100", "1")]);
    }

    #[test]
    fn test_existing_price_replaces_size() {
        let mut book = book_with_bids(vec![level("100", "1")]);
        book.apply_update(&[delta("100", "3")], &[], None);
        assert_eq!(book.bids, vec![level("100", "3")]);
    }

    #[test]
    fn test_removing_absent_price_is_a_noop() {
        let mut book = book_with_bids(vec![level("100", "1")]);
        book.apply_update(&[delta("50", "0")], &[], None);
        assert_eq!(book.bids, vec![level("100", "1")]);
    }

    #[test]
    fn test_side_stays_sorted_ascending() {
        let mut book = book_with_bids(vec![]);
        book.apply_update(
            &[delta("103", "1"), delta("101", "1"), delta("102", "1")],
            &[delta("110", "2"), delta("105", "2")],
            None,
        );
        let bid_prices: Vec<String> = book.bids.iter().map(|l| l.price.to_string()).collect();
        assert_eq!(bid_prices, ["101", "102", "103"]);
        let ask_prices: Vec<String> = book.asks.iter().map(|l| l.price.to_string()).collect();
        assert_eq!(ask_prices, ["105", "110"]);
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let mut book = book_with_bids(vec![level("100", "1")]);
        book.apply_snapshot(vec![level("90", "4")], vec![level("91", "7")]);
        assert_eq!(book.bids, vec![level("90", "4")]);
        assert_eq!(book.asks, vec![level("91", "7")]);
    }

    #[test]
    fn test_checksum_input_format() {
        let mut book = OrderBook::new(ProductSymbol::from("BTCUSD"));
        book.apply_snapshot(
            vec![level("99.5", "2"), level("100", "1")],
            vec![level("100.5", "3"), level("101", "4")],
        );
        // Asks block first, then bids, each level as price:size.
        assert_eq!(book.checksum_input(), "100.5:3:101:4:99.5:2:100:1");
        assert_eq!(
            book.checksum(),
            crc32fast::hash(b"100.5:3:101:4:99.5:2:100:1")
        );
    }

    #[test]
    fn test_checksum_covers_only_top_ten_levels() {
        let mut book = OrderBook::new(ProductSymbol::from("BTCUSD"));
        let bids: Vec<PriceLevel> = (1..=12)
            .map(|i| level(&i.to_string(), "1"))
            .collect();
        book.apply_snapshot(bids, vec![]);
        let with_twelve = book.checksum();

        // Levels beyond the tenth (ascending, so the two highest bids here)
        // do not participate.
        book.apply_update(&[delta("12", "0"), delta("11", "0")], &[], None);
        let with_ten = book.checksum();
        assert_eq!(with_twelve, with_ten);
    }

    #[test]
    fn test_update_reports_checksum_mismatch() {
        let mut book = book_with_bids(vec![level("100", "1")]);
        let good = {
            let mut probe = book.clone();
            probe.apply_update(&[delta("99", "2")], &[], None);
            probe.checksum()
        };

        assert!(book.apply_update(&[delta("99", "2")], &[], Some(good)));

        let mut book = book_with_bids(vec![level("100", "1")]);
        assert!(!book.apply_update(&[delta("99", "2")], &[], Some(good.wrapping_add(1))));
        // Deltas stay applied even when the checksum fails.
        assert_eq!(book.bids, vec![level("99", "2"), level("100", "1")]);
    }

    #[test]
    fn test_trailing_zeros_survive_into_checksum_input() {
        let mut book = OrderBook::new(ProductSymbol::from("BTCUSD"));
        book.apply_snapshot(vec![level("100.50", "0.10")], vec![]);
        assert_eq!(book.checksum_input(), ":100.50:0.10");
    }
}
