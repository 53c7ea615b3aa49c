//! Daily Spend Ledger
//!
//! One row per UTC day. Each row tracks committed spend and outstanding
//! reservations in integer micro-dollars. `check_and_reserve` runs under the
//! row's shard lock, so concurrent reservations can never jointly pass the
//! same remaining headroom.
//!
//! A [`Reservation`] is settled exactly once: [`BudgetLedger::commit`],
//! [`BudgetLedger::release`], or on drop (treated as release).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;

const MICROS_PER_USD: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}

fn to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

// ============================================================================
// Configuration
// ============================================================================

/// Ledger limits
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetConfig {
    /// Spend cap per UTC day
    pub daily_budget_usd: f64,
    /// Percentage of the cap that triggers the warning
    pub alert_threshold_pct: u8,
    /// Days of history kept
    pub retain_days: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: 10.0,
            alert_threshold_pct: 80,
            retain_days: 7,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Where today's spend stands relative to the cap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    /// Below the alert threshold
    OnTrack,
    /// At or above the alert threshold
    Warning,
    /// Cap reached
    Exhausted,
}

impl BudgetStatus {
    fn from_spend(spent_micros: u64, limit_micros: u64, threshold_pct: u8) -> Self {
        if spent_micros >= limit_micros {
            Self::Exhausted
        } else if u128::from(spent_micros) * 100
            >= u128::from(limit_micros) * u128::from(threshold_pct)
        {
            Self::Warning
        } else {
            Self::OnTrack
        }
    }
}

/// Committed spend for one day
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DaySpend {
    /// UTC day
    pub day: NaiveDate,
    /// Committed spend
    pub spent_usd: f64,
    /// Outstanding reservations
    pub reserved_usd: f64,
}

/// Reservation refused
#[derive(Clone, Debug, Error, PartialEq)]
#[error("daily budget of ${limit_usd:.2} exhausted for {day}: ${committed_usd:.4} spent, ${reserved_usd:.4} reserved, ${requested_usd:.4} requested")]
pub struct BudgetDenied {
    /// UTC day
    pub day: NaiveDate,
    /// Cap
    pub limit_usd: f64,
    /// Already committed
    pub committed_usd: f64,
    /// Held by other reservations
    pub reserved_usd: f64,
    /// What was asked for
    pub requested_usd: f64,
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Default)]
struct DayRow {
    spent_micros: u64,
    reserved_micros: u64,
    alerted: bool,
}

type Rows = Arc<DashMap<NaiveDate, DayRow>>;

/// Spend held against a day's budget until committed or released
pub struct Reservation {
    rows: Rows,
    day: NaiveDate,
    amount_micros: u64,
    settled: AtomicBool,
}

impl Reservation {
    /// Day the reservation counts against
    #[must_use]
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Amount held
    #[must_use]
    pub fn amount_usd(&self) -> f64 {
        to_usd(self.amount_micros)
    }

    /// Mark settled; returns false if it already was
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    fn give_back(&self) {
        if self.settle() {
            if let Some(mut row) = self.rows.get_mut(&self.day) {
                row.reserved_micros = row.reserved_micros.saturating_sub(self.amount_micros);
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("day", &self.day)
            .field("amount_usd", &self.amount_usd())
            .field("settled", &self.settled.load(Ordering::Acquire))
            .finish()
    }
}

/// Per-day spend tracking with atomic reservations
pub struct BudgetLedger {
    config: BudgetConfig,
    limit_micros: u64,
    clock: Arc<dyn Clock>,
    rows: Rows,
}

impl BudgetLedger {
    /// Create an empty ledger
    pub fn new(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let limit_micros = to_micros(config.daily_budget_usd);
        Self {
            config,
            limit_micros,
            clock,
            rows: Arc::new(DashMap::new()),
        }
    }

    /// Daily cap
    #[must_use]
    pub fn daily_budget_usd(&self) -> f64 {
        self.config.daily_budget_usd
    }

    /// Hold `cost_usd` against today's budget
    pub fn check_and_reserve(&self, cost_usd: f64) -> Result<Reservation, BudgetDenied> {
        let day = self.clock.today();
        let amount = to_micros(cost_usd);

        if !self.rows.contains_key(&day) {
            self.prune(day);
        }

        {
            let mut row = self.rows.entry(day).or_default();
            let committed = row.spent_micros.saturating_add(row.reserved_micros);
            if committed.saturating_add(amount) > self.limit_micros {
                return Err(BudgetDenied {
                    day,
                    limit_usd: self.config.daily_budget_usd,
                    committed_usd: to_usd(row.spent_micros),
                    reserved_usd: to_usd(row.reserved_micros),
                    requested_usd: to_usd(amount),
                });
            }
            row.reserved_micros += amount;
        }

        Ok(Reservation {
            rows: Arc::clone(&self.rows),
            day,
            amount_micros: amount,
            settled: AtomicBool::new(false),
        })
    }

    /// Convert a reservation into actual spend; returns what was charged
    ///
    /// Spend lands on the reservation's day even if the call finished after
    /// midnight. A cost above the reservation is charged only up to the day's
    /// unreserved headroom, so committed spend never passes the cap.
    pub fn commit(&self, reservation: Reservation, actual_cost_usd: f64) -> f64 {
        if !reservation.settle() {
            return 0.0;
        }
        let actual = to_micros(actual_cost_usd);
        let day = reservation.day;

        let mut row = self.rows.entry(day).or_default();
        row.reserved_micros = row.reserved_micros.saturating_sub(reservation.amount_micros);
        let headroom = self
            .limit_micros
            .saturating_sub(row.spent_micros.saturating_add(row.reserved_micros));
        let charged = actual.min(headroom.max(reservation.amount_micros));
        if charged < actual {
            tracing::warn!(
                %day,
                reserved_usd = to_usd(reservation.amount_micros),
                reported_usd = to_usd(actual),
                charged_usd = to_usd(charged),
                "Reported cost exceeds reservation and remaining budget; capped"
            );
        }
        row.spent_micros = row.spent_micros.saturating_add(charged);

        let status = BudgetStatus::from_spend(
            row.spent_micros,
            self.limit_micros,
            self.config.alert_threshold_pct,
        );
        if status != BudgetStatus::OnTrack && !row.alerted {
            row.alerted = true;
            tracing::warn!(
                %day,
                spent_usd = to_usd(row.spent_micros),
                limit_usd = self.config.daily_budget_usd,
                threshold_pct = self.config.alert_threshold_pct,
                "Daily budget alert threshold crossed"
            );
        }
        to_usd(charged)
    }

    /// Return an unused reservation
    pub fn release(&self, reservation: Reservation) {
        reservation.give_back();
    }

    /// Committed spend today
    #[must_use]
    pub fn spent_today(&self) -> f64 {
        let day = self.clock.today();
        self.rows.get(&day).map_or(0.0, |row| to_usd(row.spent_micros))
    }

    /// Outstanding reservations today
    #[must_use]
    pub fn reserved_today(&self) -> f64 {
        let day = self.clock.today();
        self.rows
            .get(&day)
            .map_or(0.0, |row| to_usd(row.reserved_micros))
    }

    /// Headroom left today after spend and reservations
    #[must_use]
    pub fn remaining_today(&self) -> f64 {
        let day = self.clock.today();
        let used = self
            .rows
            .get(&day)
            .map_or(0, |row| row.spent_micros.saturating_add(row.reserved_micros));
        to_usd(self.limit_micros.saturating_sub(used))
    }

    /// Today's status
    #[must_use]
    pub fn status(&self) -> BudgetStatus {
        let day = self.clock.today();
        let spent = self.rows.get(&day).map_or(0, |row| row.spent_micros);
        BudgetStatus::from_spend(spent, self.limit_micros, self.config.alert_threshold_pct)
    }

    /// Retained rows, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<DaySpend> {
        let mut days: Vec<DaySpend> = self
            .rows
            .iter()
            .map(|row| DaySpend {
                day: *row.key(),
                spent_usd: to_usd(row.spent_micros),
                reserved_usd: to_usd(row.reserved_micros),
            })
            .collect();
        days.sort_by_key(|d| d.day);
        days
    }

    fn prune(&self, today: NaiveDate) {
        let cutoff = today - chrono::Duration::days(i64::from(self.config.retain_days));
        self.rows.retain(|day, _| *day > cutoff);
    }
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("config", &self.config)
            .field("days", &self.rows.len())
            .finish()
    }
}
