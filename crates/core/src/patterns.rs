//! Interaction-pattern memory used for predictive suggestions.
//!
//! Successful tool calls are bucketed by local hour of day. A function that
//! keeps being used at the same hour is offered back to the user, at most once
//! per calendar day.

use crate::tools::catalog;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub function: &'static str,
    pub text: String,
}

#[derive(Debug)]
pub struct InteractionPatterns {
    min_uses: u32,
    usage: HashMap<(u32, &'static str), u32>,
    last_suggested: HashMap<&'static str, NaiveDate>,
}

impl InteractionPatterns {
    pub fn new(min_uses: u32) -> Self {
        Self {
            min_uses: min_uses.max(1),
            usage: HashMap::new(),
            last_suggested: HashMap::new(),
        }
    }

    /// Records one successful use of `function` at local time `at`.
    ///
    /// Names outside the catalog are ignored.
    pub fn record(&mut self, function: &str, at: NaiveDateTime) {
        if let Some(spec) = catalog::lookup(function) {
            *self.usage.entry((at.hour(), spec.name)).or_insert(0) += 1;
        }
    }

    pub fn uses_at(&self, function: &str, hour: u32) -> u32 {
        self.usage
            .iter()
            .find(|((h, name), _)| *h == hour && *name == function)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Returns the most habitual function for the current hour, if it has
    /// crossed the threshold and was not already suggested today.
    pub fn suggest(&mut self, now: NaiveDateTime) -> Option<Suggestion> {
        let hour = now.hour();
        let today = now.date();
        let (function, _) = self
            .usage
            .iter()
            .filter(|((h, _), count)| *h == hour && **count >= self.min_uses)
            .filter(|((_, name), _)| self.last_suggested.get(name) != Some(&today))
            .max_by(|((_, a_name), a), ((_, b_name), b)| a.cmp(b).then_with(|| b_name.cmp(a_name)))
            .map(|((_, name), count)| (*name, *count))?;

        self.last_suggested.insert(function, today);
        let label = catalog::lookup(function).map(|spec| spec.label).unwrap_or("do that");
        Some(Suggestion {
            function,
            text: format!("You usually {label} around this time. Want me to do that now?"),
        })
    }
}
