//! Cron-backed occurrence rule.
//!
//! Expression evaluation is delegated to the `cron` crate, which supports
//! second-granularity fields. This module only adapts its iterator API to
//! the [`OccurrenceRule`] contract.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Result, TriggerError};
use crate::trigger::{OccurrenceRule, Trigger, TriggerBuilder};

/// An [`OccurrenceRule`] evaluating a cron expression with seconds.
#[derive(Debug)]
pub struct CronRule {
    schedule: Schedule,
}

impl CronRule {
    /// Parse a cron expression (seconds field included, e.g. `0 30 9 * * *`).
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = normalize(expression);
        if expression.is_empty() {
            return Err(TriggerError::EmptyExpression);
        }
        let schedule =
            Schedule::from_str(&expression).map_err(|e| TriggerError::InvalidExpression {
                scheme: "cron".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { schedule })
    }
}

impl OccurrenceRule for CronRule {
    fn next_occurrence(&self, origin: DateTime<Utc>, inclusive: bool) -> Option<DateTime<Utc>> {
        if inclusive && self.schedule.includes(origin) {
            return Some(origin);
        }
        self.schedule.after(&origin).next()
    }
}

/// Builder for the `"cron"` scheme.
pub struct CronBuilder;

impl TriggerBuilder for CronBuilder {
    fn build(&self, expression: &str) -> Result<Trigger> {
        let normalized = normalize(expression);
        let rule = CronRule::parse(&normalized)?;
        Ok(Trigger::new("cron", normalized, Arc::new(rule)))
    }
}

/// Canonical expression text: trimmed, inner whitespace collapsed.
///
/// Trigger identity and the interning cache both rely on this, so
/// `"0  * * * * *"` and `"0 * * * * *"` name the same trigger.
pub fn normalize(expression: &str) -> String {
    expression.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn hourly_rolls_to_next_top_of_hour() {
        let rule = CronRule::parse("0 0 * * * *").unwrap();
        let next = rule.next_occurrence(at(2026, 1, 5, 12, 30, 15), false);
        assert_eq!(next, Some(at(2026, 1, 5, 13, 0, 0)));
    }

    #[test]
    fn exclusive_skips_a_matching_origin() {
        let rule = CronRule::parse("0 0 * * * *").unwrap();
        let origin = at(2026, 1, 5, 13, 0, 0);
        assert_eq!(rule.next_occurrence(origin, false), Some(at(2026, 1, 5, 14, 0, 0)));
    }

    #[test]
    fn inclusive_returns_a_matching_origin() {
        let rule = CronRule::parse("0 0 * * * *").unwrap();
        let origin = at(2026, 1, 5, 13, 0, 0);
        assert_eq!(rule.next_occurrence(origin, true), Some(origin));
    }

    #[test]
    fn second_granularity_is_supported() {
        let rule = CronRule::parse("*/15 * * * * *").unwrap();
        let next = rule.next_occurrence(at(2026, 1, 5, 12, 0, 7), false);
        assert_eq!(next, Some(at(2026, 1, 5, 12, 0, 15)));
    }

    #[test]
    fn exhausted_schedule_yields_none() {
        // Year field pinned in the past: no future occurrence exists.
        let rule = CronRule::parse("0 0 0 1 1 * 2020").unwrap();
        assert_eq!(rule.next_occurrence(at(2026, 1, 1, 0, 0, 0), false), None);
    }

    #[test]
    fn invalid_expression_is_reported() {
        let err = CronRule::parse("not a cron line").unwrap_err();
        assert!(matches!(err, TriggerError::InvalidExpression { .. }));
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("  0   0 *  * * *  "), "0 0 * * * *");
    }
}
