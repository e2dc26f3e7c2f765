//! Daily light integral: trapezoidal integration of photon flux over the
//! local calendar day.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};

/// µmol → mol.
const MICRO: f64 = 1e-6;

/// Default lux → PPFD (µmol·s⁻¹·m⁻²) factor for daylight-ish sources.
pub const DEFAULT_LUX_TO_PPFD: f64 = 0.0185;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Sample {
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
    ppfd: f64,
}

/// Accumulates one local day at a time. When a day closes, its total becomes
/// the published reading and the accumulator restarts at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DliIntegrator {
    day: Option<Date>,
    accumulated: f64,
    last_sample: Option<Sample>,
    published: Option<f64>,
    published_day: Option<Date>,
}

impl DliIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total of the most recently closed day, mol/(d·m²).
    pub fn published(&self) -> Option<f64> {
        self.published
    }

    pub fn published_day(&self) -> Option<Date> {
        self.published_day
    }

    /// Running total for the day still open.
    pub fn accumulated(&self) -> f64 {
        self.accumulated
    }

    /// Feed a PPFD sample (µmol·s⁻¹·m⁻²). Samples older than the previous
    /// one are ignored. Returns whether the published value changed.
    pub fn add_sample(&mut self, ts: OffsetDateTime, ppfd: f64, offset: UtcOffset) -> bool {
        if !ppfd.is_finite() {
            return self.mark_gap();
        }
        let next = Sample {
            ts,
            ppfd: ppfd.max(0.0),
        };

        let mut changed = false;
        match self.last_sample {
            Some(prev) if ts < prev.ts => return false,
            Some(prev) => changed |= self.integrate(prev, next, offset),
            None => {}
        }
        changed |= self.advance_to(ts.to_offset(offset).date());
        self.last_sample = Some(next);
        changed
    }

    /// The source went unavailable: the interval up to the next sample
    /// contributes nothing.
    pub fn mark_gap(&mut self) -> bool {
        self.last_sample = None;
        false
    }

    /// Close the open day once `now` has passed local midnight, even if no
    /// sample arrived since.
    pub fn roll_to(&mut self, now: OffsetDateTime, offset: UtcOffset) -> bool {
        if self.day.is_none() {
            return false;
        }
        self.advance_to(now.to_offset(offset).date())
    }

    // -- internals ----------------------------------------------------------

    fn integrate(&mut self, prev: Sample, next: Sample, offset: UtcOffset) -> bool {
        let total = (next.ts - prev.ts).as_seconds_f64();
        if total <= 0.0 {
            return false;
        }
        let area = (prev.ppfd + next.ppfd) / 2.0 * total * MICRO;

        let mut changed = false;
        let mut cursor = prev.ts;
        while cursor < next.ts {
            let date = cursor.to_offset(offset).date();
            let end = match next_local_midnight(date, offset) {
                Some(midnight) if midnight < next.ts => midnight,
                _ => next.ts,
            };
            let share = area * (end - cursor).as_seconds_f64() / total;
            changed |= self.advance_to(date);
            changed |= self.credit(date, share);
            cursor = end;
        }
        changed
    }

    fn advance_to(&mut self, date: Date) -> bool {
        match self.day {
            None => {
                self.day = Some(date);
                self.accumulated = 0.0;
                false
            }
            Some(open) if date > open => {
                if open.next_day() == Some(date) {
                    self.published = Some(self.accumulated);
                    self.published_day = Some(open);
                } else {
                    // Whole days passed without any sample.
                    self.published = Some(0.0);
                    self.published_day = date.previous_day();
                }
                self.day = Some(date);
                self.accumulated = 0.0;
                true
            }
            Some(_) => false,
        }
    }

    fn credit(&mut self, date: Date, mol: f64) -> bool {
        if self.day == Some(date) {
            self.accumulated += mol;
            false
        } else if self.published_day == Some(date) {
            self.published = Some(self.published.unwrap_or(0.0) + mol);
            mol != 0.0
        } else {
            false
        }
    }
}

fn next_local_midnight(date: Date, offset: UtcOffset) -> Option<OffsetDateTime> {
    Some(date.next_day()?.midnight().assume_offset(offset))
}

// ===========================================================================
// Tests
// ===========================================================================
