//! Metrics calculator (C6, §4.6): pure aggregation over
//! `(EquityBars, Trades)`. Zero-trade and zero-volatility cases produce
//! well-defined `None` sentinels, never `NaN`.

use crate::domain::{EquityBar, MetricsSummary, Trade};

const TRADING_PERIODS_PER_YEAR: f64 = 252.0;

pub fn summarize(equity: &[EquityBar], trades: &[Trade], initial_equity: f64) -> MetricsSummary {
    let total_return = match equity.last() {
        Some(last) if initial_equity != 0.0 => (last.nav - initial_equity) / initial_equity,
        _ => 0.0,
    };

    let returns = bar_returns(equity);
    let sharpe = sharpe_ratio(&returns);
    let sortino = sortino_ratio(&returns);
    // `EquityBar::drawdown` is negative-or-zero (§3: `nav/peak_nav - 1`);
    // `max_drawdown` reports the deepest excursion as a positive magnitude.
    let max_drawdown = equity.iter().map(|e| -e.drawdown).fold(0.0_f64, f64::max);

    let trade_count = trades.len() as u64;
    let win_rate = win_rate(trades);

    let exposure_pct = if equity.is_empty() {
        0.0
    } else {
        let exposed_bars = equity.iter().filter(|e| e.position_after.abs() > 1e-12).count();
        exposed_bars as f64 / equity.len() as f64
    };

    let turnover = turnover(trades, equity);

    MetricsSummary {
        total_return,
        sharpe,
        sortino,
        max_drawdown,
        trade_count,
        win_rate,
        exposure_pct,
        turnover,
    }
}

fn bar_returns(equity: &[EquityBar]) -> Vec<f64> {
    equity
        .windows(2)
        .map(|pair| {
            if pair[0].nav == 0.0 {
                0.0
            } else {
                (pair[1].nav - pair[0].nav) / pair[0].nav
            }
        })
        .collect()
}

fn sharpe_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() as f64 - 1.0);
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        return None;
    }
    Some(mean / stdev * TRADING_PERIODS_PER_YEAR.sqrt())
}

fn sortino_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return None;
    }
    let downside_variance =
        downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64;
    let downside_dev = downside_variance.sqrt();
    if downside_dev == 0.0 {
        return None;
    }
    Some(mean / downside_dev * TRADING_PERIODS_PER_YEAR.sqrt())
}

/// A "win" is a round trip (the portion of a fill that closes existing
/// exposure) whose realized PnL, net of that fill's fees, comes out
/// positive. Replays `trades` through the same signed cost-basis accounting
/// `execution::simulate` uses, since `Trade` itself only records fills, not
/// round trips.
fn win_rate(trades: &[Trade]) -> Option<f64> {
    if trades.is_empty() {
        return None;
    }

    let mut position = 0.0_f64;
    let mut cost_basis = 0.0_f64;
    let mut round_trips = 0u64;
    let mut wins = 0u64;

    for t in trades {
        let signed_qty = match t.side {
            crate::domain::Side::Buy => t.qty,
            crate::domain::Side::Sell => -t.qty,
        };
        if position != 0.0 && position.signum() != signed_qty.signum() {
            let closing_qty = signed_qty.abs().min(position.abs());
            let avg_price = cost_basis / position;
            let realized = closing_qty * position.signum() * (t.price - avg_price) - t.fees;
            round_trips += 1;
            if realized > 0.0 {
                wins += 1;
            }
            cost_basis -= cost_basis * (closing_qty / position.abs());
            let opening_qty = signed_qty.abs() - closing_qty;
            cost_basis += t.price * opening_qty * signed_qty.signum();
        } else {
            cost_basis += t.price * signed_qty;
        }
        position += signed_qty;
    }

    if round_trips == 0 {
        return None;
    }
    Some(wins as f64 / round_trips as f64)
}

fn turnover(trades: &[Trade], equity: &[EquityBar]) -> f64 {
    if equity.is_empty() {
        return 0.0;
    }
    let avg_nav = equity.iter().map(|e| e.nav).sum::<f64>() / equity.len() as f64;
    if avg_nav == 0.0 {
        return 0.0;
    }
    let traded_notional: f64 = trades.iter().map(|t| t.price * t.qty).sum();
    traded_notional / avg_nav
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;

    fn bar(ts: i64, nav: f64, drawdown: f64, position_after: f64) -> EquityBar {
        EquityBar {
            ts,
            nav,
            peak_nav: nav.max(1000.0),
            drawdown,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            position_after,
            trade_count_cum: 0,
        }
    }

    #[test]
    fn zero_trades_yields_none_win_rate() {
        let equity = vec![bar(0, 1000.0, 0.0, 0.0), bar(1, 1000.0, 0.0, 0.0)];
        let summary = summarize(&equity, &[], 1000.0);
        assert_eq!(summary.win_rate, None);
        assert_eq!(summary.trade_count, 0);
    }

    #[test]
    fn constant_returns_yield_none_sharpe() {
        let equity: Vec<EquityBar> = (0..5).map(|i| bar(i, 1000.0, 0.0, 0.0)).collect();
        let summary = summarize(&equity, &[], 1000.0);
        assert_eq!(summary.sharpe, None);
    }

    #[test]
    fn positive_drift_yields_positive_sharpe() {
        let equity: Vec<EquityBar> = (0..10)
            .map(|i| bar(i, 1000.0 + i as f64 * 10.0, 0.0, 1.0))
            .collect();
        let summary = summarize(&equity, &[], 1000.0);
        assert!(summary.sharpe.unwrap() > 0.0);
    }

    #[test]
    fn total_return_matches_final_nav_delta() {
        let equity = vec![bar(0, 1000.0, 0.0, 0.0), bar(1, 1100.0, 0.0, 0.0)];
        let summary = summarize(&equity, &[], 1000.0);
        assert!((summary.total_return - 0.1).abs() < 1e-9);
    }

    fn trade(side: Side, qty: f64, price: f64, fees: f64) -> Trade {
        Trade {
            ts: 0,
            side,
            qty,
            price,
            fees,
            slippage: 0.0,
            notes: None,
        }
    }

    #[test]
    fn losing_round_trip_is_not_counted_as_a_win() {
        // Buy 5@100, sell 5@90: realized pnl = 5*(90-100) = -50, a loss.
        let trades = vec![
            trade(Side::Buy, 5.0, 100.0, 0.0),
            trade(Side::Sell, 5.0, 90.0, 0.0),
        ];
        let equity = vec![bar(0, 1000.0, 0.0, 0.0), bar(1, 1000.0, 0.0, 0.0)];
        let summary = summarize(&equity, &trades, 1000.0);
        assert_eq!(summary.win_rate, Some(0.0));
    }

    #[test]
    fn winning_and_losing_round_trips_average_out() {
        // Round trip 1: buy 5@100, sell 5@120 -> win (+100).
        // Round trip 2: buy 5@120, sell 5@110 -> loss (-50).
        let trades = vec![
            trade(Side::Buy, 5.0, 100.0, 0.0),
            trade(Side::Sell, 5.0, 120.0, 0.0),
            trade(Side::Buy, 5.0, 120.0, 0.0),
            trade(Side::Sell, 5.0, 110.0, 0.0),
        ];
        let equity = vec![bar(0, 1000.0, 0.0, 0.0), bar(1, 1000.0, 0.0, 0.0)];
        let summary = summarize(&equity, &trades, 1000.0);
        assert_eq!(summary.win_rate, Some(0.5));
    }

    #[test]
    fn high_fees_can_turn_a_profitable_exit_into_a_loss() {
        // Buy 5@100, sell 5@105 (gross +25) but fees of 30 outweigh it.
        let trades = vec![
            trade(Side::Buy, 5.0, 100.0, 0.0),
            trade(Side::Sell, 5.0, 105.0, 30.0),
        ];
        let equity = vec![bar(0, 1000.0, 0.0, 0.0), bar(1, 1000.0, 0.0, 0.0)];
        let summary = summarize(&equity, &trades, 1000.0);
        assert_eq!(summary.win_rate, Some(0.0));
    }

    #[test]
    fn turnover_scales_with_traded_notional() {
        let equity = vec![bar(0, 1000.0, 0.0, 1.0), bar(1, 1000.0, 0.0, 1.0)];
        let trades = vec![Trade {
            ts: 0,
            side: Side::Buy,
            qty: 10.0,
            price: 100.0,
            fees: 0.0,
            slippage: 0.0,
            notes: None,
        }];
        let summary = summarize(&equity, &trades, 1000.0);
        assert!(summary.turnover > 0.0);
    }
}
