//! In-memory ledger of open positions keyed by symbol.

use std::collections::HashMap;

use crate::models::Position;

/// Open positions per symbol, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct PositionLedger {
    positions: HashMap<String, Vec<Position>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open positions for `symbol`, oldest first.
    pub fn get(&self, symbol: &str) -> &[Position] {
        self.positions
            .get(symbol)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Look up a position by id.
    pub fn find(&self, id: &str) -> Option<&Position> {
        self.positions.values().flatten().find(|p| p.id == id)
    }

    /// Append a position to its symbol's sequence.
    pub fn insert(&mut self, position: Position) {
        self.positions
            .entry(position.symbol.clone())
            .or_default()
            .push(position);
    }

    /// Remove a position by id, returning it if it was open.
    pub fn remove(&mut self, id: &str) -> Option<Position> {
        let (symbol, index) = self.locate(id)?;
        let entries = self.positions.get_mut(&symbol)?;
        let removed = entries.remove(index);

        if entries.is_empty() {
            self.positions.remove(&symbol);
        }

        Some(removed)
    }

    /// Replace a position in place, keeping its slot. Returns false if the id
    /// is not open or the replacement carries a different id or symbol.
    pub fn replace(&mut self, id: &str, updated: Position) -> bool {
        if updated.id != id {
            return false;
        }

        let Some((symbol, index)) = self.locate(id) else {
            return false;
        };

        if updated.symbol != symbol {
            return false;
        }

        match self.positions.get_mut(&symbol) {
            Some(entries) => {
                entries[index] = updated;
                true
            }
            None => false,
        }
    }

    /// Every open position, grouped by symbol in sorted symbol order.
    pub fn all(&self) -> Vec<Position> {
        let mut symbols: Vec<_> = self.positions.keys().collect();
        symbols.sort();
        symbols
            .into_iter()
            .flat_map(|s| self.positions[s].iter().cloned())
            .collect()
    }

    /// Total number of open positions.
    pub fn len(&self) -> usize {
        self.positions.values().map(Vec::len).sum()
    }

    fn locate(&self, id: &str) -> Option<(String, usize)> {
        self.positions.iter().find_map(|(symbol, entries)| {
            entries
                .iter()
                .position(|p| p.id == id)
                .map(|index| (symbol.clone(), index))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn make_position(symbol: &str) -> Position {
        Position::open(
            symbol.to_string(),
            Side::Long,
            dec!(100),
            dec!(10),
            2,
            dec!(5),
            dec!(10),
        )
    }

    #[test]
    fn test_insertion_order_is_stable() {
        let mut ledger = PositionLedger::new();
        let a = make_position("XBTUSDTM");
        let b = make_position("XBTUSDTM");
        let c = make_position("ETHUSDTM");

        ledger.insert(a.clone());
        ledger.insert(c.clone());
        ledger.insert(b.clone());

        let ids: Vec<_> = ledger.get("XBTUSDTM").iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(ledger.get("ETHUSDTM").len(), 1);
        assert!(ledger.get("SOLUSDTM").is_empty());
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_remove() {
        let mut ledger = PositionLedger::new();
        let pos = make_position("XBTUSDTM");
        ledger.insert(pos.clone());

        assert_eq!(ledger.remove(&pos.id), Some(pos.clone()));
        assert!(ledger.find(&pos.id).is_none());
        assert_eq!(ledger.len(), 0);
        assert_eq!(ledger.remove(&pos.id), None);
    }

    #[test]
    fn test_replace_keeps_slot() {
        let mut ledger = PositionLedger::new();
        let first = make_position("XBTUSDTM");
        let second = make_position("XBTUSDTM");
        ledger.insert(first.clone());
        ledger.insert(second.clone());

        assert!(ledger.replace(&first.id, first.resized(dec!(4))));
        let positions = ledger.get("XBTUSDTM");
        assert_eq!(positions[0].size, dec!(4));
        assert_eq!(positions[1].id, second.id);

        // Mismatched id is refused
        assert!(!ledger.replace(&first.id, second.clone()));
        assert!(!ledger.replace("missing", make_position("XBTUSDTM")));
    }
}
