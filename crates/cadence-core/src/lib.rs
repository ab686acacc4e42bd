//! `cadence-core` — the trigger abstraction shared by the scheduling engine.
//!
//! # Overview
//!
//! A [`trigger::Trigger`] is an immutable value that computes its next
//! occurrence timestamp through an [`trigger::OccurrenceRule`]. Triggers are
//! compared and hashed by (scheme, normalized expression text) and interned
//! in a global cache, so building the same expression twice yields the same
//! underlying rule.
//!
//! The `"cron"` scheme ships built in (second-granularity expressions via
//! the `cron` crate); additional schemes plug in through
//! [`trigger::TriggerBuilder`] and [`trigger::register`].

pub mod cron;
pub mod error;
pub mod trigger;

pub use cron::CronRule;
pub use error::{Result, TriggerError};
pub use trigger::{OccurrenceRule, Trigger, TriggerBuilder};
