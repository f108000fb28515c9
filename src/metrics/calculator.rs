//! Performance report over closed positions: win rate, profit factor,
//! P&L dispersion and drawdown.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::{CloseReason, ClosedPosition};

/// Count and P&L of trades closed for one reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasonBreakdown {
    pub reason: CloseReason,
    pub count: u32,
    pub pnl: Decimal,
}

/// Aggregate performance of a trade history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Wins over decisive (non break-even) trades, 0.0 - 1.0
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    /// Average loss as a positive amount
    pub avg_loss: Decimal,
    pub profit_factor: f64,
    pub expectancy: Decimal,
    pub pnl_std_dev: f64,
    /// Largest peak-to-trough fall of cumulative P&L
    pub max_drawdown: Decimal,
    pub avg_duration_secs: i64,
    pub by_reason: Vec<ReasonBreakdown>,
}

impl Default for PerformanceReport {
    fn default() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_pnl: Decimal::ZERO,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            profit_factor: 0.0,
            expectancy: Decimal::ZERO,
            pnl_std_dev: 0.0,
            max_drawdown: Decimal::ZERO,
            avg_duration_secs: 0,
            by_reason: Vec::new(),
        }
    }
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Build a report from closed positions in close order.
    pub fn calculate(history: &[ClosedPosition]) -> PerformanceReport {
        let mut report = PerformanceReport::default();

        if history.is_empty() {
            return report;
        }

        let pnls: Vec<Decimal> = history.iter().map(|r| r.pnl).collect();
        report.total_trades = history.len() as u32;
        report.total_pnl = pnls.iter().copied().sum();
        report.expectancy = report.total_pnl / Decimal::from(report.total_trades);

        Self::calculate_win_loss(&mut report, &pnls);
        report.max_drawdown = Self::max_drawdown(&pnls);

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        if returns.len() >= 2 {
            report.pnl_std_dev = returns.std_dev();
        }

        let total_secs: i64 = history.iter().map(|r| r.duration_seconds).sum();
        report.avg_duration_secs = total_secs / history.len() as i64;

        for reason in [CloseReason::StopLoss, CloseReason::TakeProfit, CloseReason::Manual] {
            let closed: Vec<_> = history.iter().filter(|r| r.reason == reason).collect();
            if closed.is_empty() {
                continue;
            }
            report.by_reason.push(ReasonBreakdown {
                reason,
                count: closed.len() as u32,
                pnl: closed.iter().map(|r| r.pnl).sum(),
            });
        }

        report
    }

    fn calculate_win_loss(report: &mut PerformanceReport, pnls: &[Decimal]) {
        let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = pnls
            .iter()
            .copied()
            .filter(|p| *p < Decimal::ZERO)
            .map(|p| p.abs())
            .collect();

        report.winning_trades = wins.len() as u32;
        report.losing_trades = losses.len() as u32;

        let decisive = wins.len() + losses.len();
        if decisive > 0 {
            report.win_rate = wins.len() as f64 / decisive as f64;
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().copied().sum();

        if !wins.is_empty() {
            report.avg_win = gross_profit / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            report.avg_loss = gross_loss / Decimal::from(losses.len() as u32);
        }

        if gross_loss > Decimal::ZERO {
            report.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }
    }

    fn max_drawdown(pnls: &[Decimal]) -> Decimal {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            max_dd = max_dd.max(peak - equity);
        }

        max_dd
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Performance ===")?;
        writeln!(f, "Closed Trades:  {}", self.total_trades)?;
        writeln!(
            f,
            "Win Rate:       {:.1}% ({} W / {} L)",
            self.win_rate * 100.0,
            self.winning_trades,
            self.losing_trades
        )?;
        writeln!(f, "Total P&L:      {:.2}", self.total_pnl)?;
        writeln!(f, "Avg Win:        {:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:       {:.2}", self.avg_loss)?;
        writeln!(f, "Profit Factor:  {:.2}", self.profit_factor)?;
        writeln!(f, "Expectancy:     {:.2}", self.expectancy)?;
        writeln!(f, "P&L Std Dev:    {:.2}", self.pnl_std_dev)?;
        writeln!(f, "Max Drawdown:   {:.2}", self.max_drawdown)?;
        writeln!(f, "Avg Duration:   {}s", self.avg_duration_secs)?;

        if !self.by_reason.is_empty() {
            writeln!(f, "\n--- By Close Reason ---")?;
            for row in &self.by_reason {
                writeln!(f, "  {:<12} {:>4} trades  {:.2}", row.reason, row.count, row.pnl)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn closed(exit: Decimal, reason: CloseReason) -> ClosedPosition {
        let position = Position::open(
            "XBTUSDTM".to_string(),
            Side::Long,
            dec!(100),
            dec!(10),
            1,
            dec!(5),
            dec!(10),
        );
        position.close(exit, reason, Utc::now()).unwrap()
    }

    #[test]
    fn test_empty_history() {
        let report = MetricsCalculator::calculate(&[]);
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.total_pnl, Decimal::ZERO);
        assert!(report.by_reason.is_empty());
    }

    #[test]
    fn test_report_aggregates() {
        // pnl: +1.2, -0.6, 0, +0.3
        let history = vec![
            closed(dec!(112), CloseReason::TakeProfit),
            closed(dec!(94), CloseReason::StopLoss),
            closed(dec!(100), CloseReason::Manual),
            closed(dec!(103), CloseReason::Manual),
        ];
        let report = MetricsCalculator::calculate(&history);

        assert_eq!(report.total_trades, 4);
        assert_eq!(report.winning_trades, 2);
        assert_eq!(report.losing_trades, 1);
        assert!((report.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.total_pnl, dec!(0.9));
        assert_eq!(report.avg_win, dec!(0.75));
        assert_eq!(report.avg_loss, dec!(0.6));
        assert!((report.profit_factor - 2.5).abs() < 1e-9);
        assert_eq!(report.max_drawdown, dec!(0.6));

        let manual = report
            .by_reason
            .iter()
            .find(|r| r.reason == CloseReason::Manual)
            .unwrap();
        assert_eq!(manual.count, 2);
        assert_eq!(manual.pnl, dec!(0.3));
        assert!(report.pnl_std_dev > 0.0);
    }

    #[test]
    fn test_display_lists_reasons() {
        let report = MetricsCalculator::calculate(&[closed(dec!(94), CloseReason::StopLoss)]);
        let text = report.to_string();
        assert!(text.contains("stop_loss"));
        assert!(text.contains("Closed Trades:  1"));
    }
}
