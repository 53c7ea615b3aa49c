//! Per-Backend Admission Control
//!
//! [`RateLimiter::try_admit`] never blocks. It hands out a [`Permit`] when the
//! backend has a free concurrency slot and headroom in both its sliding
//! 60-second window and its UTC-day counter.
//!
//! # Design
//!
//! - One rate window per backend, each behind its own short mutex
//! - Minute window: admission timestamps in a `VecDeque`, pruned lazily
//! - Day counter: reset when the UTC date changes
//! - A permit releases its concurrency slot exactly once, on `release()` or on
//!   drop; the minute/day admissions it consumed stay counted

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use super::descriptor::BackendDescriptor;
use crate::clock::Clock;

/// Sliding window length for `requests_per_minute`
const WINDOW_SECS: i64 = 60;

// ============================================================================
// Errors
// ============================================================================

/// Why admission was refused
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RateLimitRejection {
    /// All `max_concurrent` permits are outstanding
    #[error("{backend} saturated: {in_flight}/{max} in flight")]
    Saturated {
        /// Backend name
        backend: String,
        /// Permits outstanding
        in_flight: u32,
        /// Ceiling
        max: u32,
    },

    /// Per-minute quota used up
    #[error("{backend} minute quota reached ({limit}/min)")]
    MinuteQuota {
        /// Backend name
        backend: String,
        /// Configured quota
        limit: u32,
    },

    /// Per-day quota used up
    #[error("{backend} daily quota reached ({limit}/day)")]
    DailyQuota {
        /// Backend name
        backend: String,
        /// Configured quota
        limit: u32,
    },

    /// No window registered under that name
    #[error("unknown backend {0}")]
    UnknownBackend(String),
}

// ============================================================================
// Rate Window
// ============================================================================

#[derive(Debug)]
struct WindowState {
    in_flight: u32,
    minute: VecDeque<DateTime<Utc>>,
    day: NaiveDate,
    day_count: u32,
}

impl WindowState {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.minute.front() {
            if (now - *oldest).num_seconds() >= WINDOW_SECS {
                self.minute.pop_front();
            } else {
                break;
            }
        }
        let today = now.date_naive();
        if today != self.day {
            self.day = today;
            self.day_count = 0;
        }
    }
}

/// Admission state of one backend
#[derive(Debug)]
struct RateWindow {
    backend: String,
    max_concurrent: u32,
    requests_per_minute: Option<u32>,
    requests_per_day: Option<u32>,
    state: Mutex<WindowState>,
    released: Arc<Notify>,
}

impl RateWindow {
    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// Point-in-time view of one backend's window
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateSnapshot {
    /// Permits outstanding
    pub in_flight: u32,
    /// Admissions in the last 60 s
    pub last_minute: u32,
    /// Admissions today (UTC)
    pub today: u32,
}

// ============================================================================
// Permit
// ============================================================================

/// Scoped admission to one backend
///
/// Dropping the permit releases the slot. Releasing twice is a no-op.
pub struct Permit {
    window: Arc<RateWindow>,
    released: AtomicBool,
}

impl Permit {
    /// Backend this permit admits to
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.window.backend
    }

    /// Give the concurrency slot back
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.window.release_slot();
        }
    }

    /// Whether the slot has been given back
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("backend", &self.window.backend)
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Non-blocking admission control for every backend
pub struct RateLimiter {
    windows: HashMap<String, Arc<RateWindow>>,
    released: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create windows for the given backends
    pub fn new(descriptors: &[BackendDescriptor], clock: Arc<dyn Clock>) -> Self {
        let today = clock.today();
        let released = Arc::new(Notify::new());
        let windows = descriptors
            .iter()
            .map(|d| {
                let window = RateWindow {
                    backend: d.name.clone(),
                    max_concurrent: d.max_concurrent,
                    requests_per_minute: d.requests_per_minute,
                    requests_per_day: d.requests_per_day,
                    state: Mutex::new(WindowState {
                        in_flight: 0,
                        minute: VecDeque::new(),
                        day: today,
                        day_count: 0,
                    }),
                    released: Arc::clone(&released),
                };
                (d.name.clone(), Arc::new(window))
            })
            .collect();

        Self {
            windows,
            released,
            clock,
        }
    }

    /// Try to admit one call to `backend`
    pub fn try_admit(&self, backend: &str) -> Result<Permit, RateLimitRejection> {
        let window = self
            .windows
            .get(backend)
            .ok_or_else(|| RateLimitRejection::UnknownBackend(backend.to_string()))?;
        let now = self.clock.now();

        {
            let mut state = window.state.lock();
            state.prune(now);

            if state.in_flight >= window.max_concurrent {
                return Err(RateLimitRejection::Saturated {
                    backend: backend.to_string(),
                    in_flight: state.in_flight,
                    max: window.max_concurrent,
                });
            }
            if let Some(limit) = window.requests_per_minute {
                if state.minute.len() >= limit as usize {
                    return Err(RateLimitRejection::MinuteQuota {
                        backend: backend.to_string(),
                        limit,
                    });
                }
            }
            if let Some(limit) = window.requests_per_day {
                if state.day_count >= limit {
                    return Err(RateLimitRejection::DailyQuota {
                        backend: backend.to_string(),
                        limit,
                    });
                }
            }

            state.in_flight += 1;
            if window.requests_per_minute.is_some() {
                state.minute.push_back(now);
            }
            state.day_count += 1;
        }

        Ok(Permit {
            window: Arc::clone(window),
            released: AtomicBool::new(false),
        })
    }

    /// Current counts for `backend`
    #[must_use]
    pub fn snapshot(&self, backend: &str) -> Option<RateSnapshot> {
        let window = self.windows.get(backend)?;
        let mut state = window.state.lock();
        state.prune(self.clock.now());
        Some(RateSnapshot {
            in_flight: state.in_flight,
            last_minute: u32::try_from(state.minute.len()).unwrap_or(u32::MAX),
            today: state.day_count,
        })
    }

    /// Signalled whenever any permit is released
    ///
    /// Waiters registered before a release are woken; pair with a timeout,
    /// since a release can land between a rejection and the registration.
    #[must_use]
    pub fn released(&self) -> &Notify {
        &self.released
    }

    /// Permits outstanding for `backend`
    #[must_use]
    pub fn in_flight(&self, backend: &str) -> u32 {
        self.windows
            .get(backend)
            .map_or(0, |w| w.state.lock().in_flight)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backends", &self.windows.keys().collect::<Vec<_>>())
            .finish()
    }
}
