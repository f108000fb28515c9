//! Append-only history of closed positions with running statistics.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::ClosedPosition;

/// Running aggregate over closed positions.
///
/// Break-even closes count towards `total_closed` but are neither wins nor
/// losses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_closed: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub sum_win_pnl: Decimal,
    /// Sum of losing P&L (negative or zero)
    pub sum_loss_pnl: Decimal,
    /// Wins among the most recent counted outcomes
    pub recent_wins: u32,
    /// Counted outcomes in the recent window
    pub recent_counted: u32,
}

impl HistoryStats {
    /// Wins plus losses.
    pub fn counted_trades(&self) -> u32 {
        self.win_count + self.loss_count
    }

    /// Win rate over the recent window, `None` while the window is empty.
    pub fn recent_win_rate(&self) -> Option<Decimal> {
        if self.recent_counted == 0 {
            return None;
        }
        Some(Decimal::from(self.recent_wins) / Decimal::from(self.recent_counted))
    }
}

/// Closed position store. Records are never modified or removed.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    records: Vec<ClosedPosition>,
    stats: HistoryStats,
    window: usize,
    // true = win, false = loss
    recent: VecDeque<bool>,
}

impl HistoryStore {
    /// Empty store keeping the last `window` outcomes for recent performance.
    pub fn new(window: usize) -> Self {
        Self {
            records: Vec::new(),
            stats: HistoryStats::default(),
            window: window.max(1),
            recent: VecDeque::new(),
        }
    }

    /// Rebuild a store from previously persisted records, oldest first.
    pub fn from_records(window: usize, records: impl IntoIterator<Item = ClosedPosition>) -> Self {
        let mut store = Self::new(window);
        for record in records {
            store.append(record);
        }
        store
    }

    /// Append a closed position and fold it into the aggregate.
    pub fn append(&mut self, record: ClosedPosition) {
        self.stats.total_closed += 1;

        if record.is_win() {
            self.stats.win_count += 1;
            self.stats.sum_win_pnl += record.pnl;
            self.push_recent(true);
        } else if record.is_loss() {
            self.stats.loss_count += 1;
            self.stats.sum_loss_pnl += record.pnl;
            self.push_recent(false);
        }

        self.records.push(record);
    }

    fn push_recent(&mut self, win: bool) {
        self.recent.push_back(win);
        if win {
            self.stats.recent_wins += 1;
        }

        if self.recent.len() > self.window {
            if let Some(true) = self.recent.pop_front() {
                self.stats.recent_wins -= 1;
            }
        }

        self.stats.recent_counted = self.recent.len() as u32;
    }

    /// Current aggregate.
    pub fn stats(&self) -> HistoryStats {
        self.stats.clone()
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[ClosedPosition] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(pnl: Decimal) -> ClosedPosition {
        ClosedPosition {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: "ETHUSDTM".to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            exit_price: dec!(100),
            size: dec!(10),
            leverage: 2,
            pnl,
            reason: CloseReason::Manual,
            duration_seconds: 60,
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_incremental_aggregate() {
        let mut store = HistoryStore::new(20);
        store.append(record(dec!(30)));
        store.append(record(dec!(-10)));
        store.append(record(dec!(20)));
        store.append(record(Decimal::ZERO));

        let stats = store.stats();
        assert_eq!(stats.total_closed, 4);
        assert_eq!(stats.win_count, 2);
        assert_eq!(stats.loss_count, 1);
        assert_eq!(stats.sum_win_pnl, dec!(50));
        assert_eq!(stats.sum_loss_pnl, dec!(-10));
        assert_eq!(stats.counted_trades(), 3);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_recent_window_evicts_oldest() {
        let mut store = HistoryStore::new(3);
        store.append(record(dec!(5)));
        store.append(record(dec!(5)));
        store.append(record(dec!(-5)));
        assert_eq!(store.stats().recent_wins, 2);

        // Pushes the first win out of the window
        store.append(record(dec!(-5)));
        let stats = store.stats();
        assert_eq!(stats.recent_counted, 3);
        assert_eq!(stats.recent_wins, 1);
        assert_eq!(stats.win_count, 2);
    }

    #[test]
    fn test_from_records_matches_appends() {
        let records = vec![record(dec!(1)), record(dec!(-2)), record(dec!(3))];
        let rebuilt = HistoryStore::from_records(20, records.clone());

        let mut appended = HistoryStore::new(20);
        for r in records {
            appended.append(r);
        }

        assert_eq!(rebuilt.stats(), appended.stats());
        assert_eq!(rebuilt.records(), appended.records());
    }

    #[test]
    fn test_empty_store() {
        let store = HistoryStore::new(20);
        assert!(store.records().is_empty());
        assert_eq!(store.stats().recent_win_rate(), None);
    }
}
