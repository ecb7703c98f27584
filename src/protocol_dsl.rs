//! Declarative parameter plans for IRC commands.
//!
//! Grounded on the teacher's `Parse` cursor (`parse.rs`) generalized from
//! "consume one token at a time" to the slot-based planner spec.md §4.3
//! describes: each command declares slots with a `consume_at_least` /
//! `consume_at_most` range, the planner distributes the available
//! parameters across slots left to right, and any slot left with zero
//! elements yields its declared default.

use crate::error::ParseError;

/// One declared parameter slot in a command's plan.
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: &'static str,
    pub consume_at_least: usize,
    pub consume_at_most: usize,
    pub default: Option<Vec<String>>,
}

impl Slot {
    /// A slot that must consume exactly one parameter.
    pub fn required(name: &'static str) -> Self {
        Slot { name, consume_at_least: 1, consume_at_most: 1, default: None }
    }

    /// A slot that consumes at most one parameter and otherwise yields
    /// `default`.
    pub fn optional(name: &'static str, default: impl Into<String>) -> Self {
        Slot {
            name,
            consume_at_least: 0,
            consume_at_most: 1,
            default: Some(vec![default.into()]),
        }
    }

    /// A slot that consumes at most one parameter and has no default
    /// (yields an empty span when absent).
    pub fn optional_empty(name: &'static str) -> Self {
        Slot { name, consume_at_least: 0, consume_at_most: 1, default: None }
    }

    /// A greedy slot that consumes everything left after other slots
    /// have taken their minimum (e.g. a comma-separated channel list).
    pub fn greedy(name: &'static str, consume_at_least: usize) -> Self {
        Slot { name, consume_at_least, consume_at_most: usize::MAX, default: None }
    }
}

/// A resolved `[start, end)` span into the parameter list for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// The outcome of running a [`ParamPlan`] against a concrete parameter
/// list: one resolved span per declared slot, in declaration order.
pub struct PlanResult<'a> {
    params: &'a [&'a str],
    spans: Vec<Span>,
    slots: Vec<Slot>,
}

impl<'a> PlanResult<'a> {
    /// The parameters belonging to slot `idx`, or the slot's declared
    /// default if nothing was consumed.
    pub fn slot(&self, idx: usize) -> Vec<String> {
        let span = self.spans[idx];
        if span.start == span.end {
            if let Some(default) = &self.slots[idx].default {
                return default.clone();
            }
            return Vec::new();
        }
        self.params[span.start..span.end].iter().map(|s| s.to_string()).collect()
    }

    /// Convenience accessor for a slot declared with `consume_at_most == 1`.
    pub fn one(&self, idx: usize) -> Option<String> {
        self.slot(idx).into_iter().next()
    }
}

/// A declarative plan: an ordered list of slots plus, for each adjacent
/// pair, whether they form a "splitting extractor" pair (e.g. `key:value`
/// jointly claiming 0 or 1 raw parameter — modeled here as two slots that
/// share one span and split on the first `:`).
pub struct ParamPlan {
    slots: Vec<Slot>,
}

impl ParamPlan {
    pub fn new(slots: Vec<Slot>) -> Self {
        ParamPlan { slots }
    }

    /// Computes the per-slot span according to spec.md §4.3:
    /// 1. assign each slot its minimum, erroring if the total exceeds
    ///    what's available;
    /// 2. distribute the remainder left-to-right, each slot taking up to
    ///    `consume_at_most - consume_at_least` more;
    /// 3. slots left at zero elements fall back to their default at read
    ///    time (`PlanResult::slot`).
    pub fn resolve<'a>(&self, params: &'a [&'a str]) -> Result<PlanResult<'a>, ParseError> {
        let total = params.len();
        let min_sum: usize = self.slots.iter().map(|s| s.consume_at_least).sum();
        if min_sum > total {
            return Err(ParseError::InsufficientParams { needed: min_sum, got: total });
        }

        let mut counts: Vec<usize> = self.slots.iter().map(|s| s.consume_at_least).collect();
        let mut remaining = total - min_sum;
        for (slot, count) in self.slots.iter().zip(counts.iter_mut()) {
            if remaining == 0 {
                break;
            }
            let room = slot.consume_at_most.saturating_sub(slot.consume_at_least);
            let take = room.min(remaining);
            *count += take;
            remaining -= take;
        }

        let mut spans = Vec::with_capacity(self.slots.len());
        let mut cursor = 0;
        for count in counts {
            spans.push(Span { start: cursor, end: cursor + count });
            cursor += count;
        }

        Ok(PlanResult { params, spans, slots: self.slots.clone() })
    }
}

/// Splits a single `key:value` parameter (used by `CAP REQ` style
/// splitting extractors) into its two halves, joining as 0 or 1 raw
/// token per spec.md §4.3.
pub fn split_key_value(raw: &str) -> (String, Option<String>) {
    match raw.split_once(':') {
        Some((k, v)) => (k.to_string(), Some(v.to_string())),
        None => (raw.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_assignment_then_left_to_right_distribution() {
        let plan = ParamPlan::new(vec![
            Slot::required("channel"),
            Slot::optional_empty("key"),
        ]);
        let params = ["#rust", "secret"];
        let resolved = plan.resolve(&params).unwrap();
        assert_eq!(resolved.one(0).as_deref(), Some("#rust"));
        assert_eq!(resolved.one(1).as_deref(), Some("secret"));
    }

    #[test]
    fn missing_optional_yields_default() {
        let plan = ParamPlan::new(vec![
            Slot::required("nick"),
            Slot::optional("hopcount", "0"),
        ]);
        let params = ["alice"];
        let resolved = plan.resolve(&params).unwrap();
        assert_eq!(resolved.one(0).as_deref(), Some("alice"));
        assert_eq!(resolved.one(1).as_deref(), Some("0"));
    }

    #[test]
    fn insufficient_params_is_an_error() {
        let plan = ParamPlan::new(vec![Slot::required("a"), Slot::required("b")]);
        let params = ["only-one"];
        assert!(plan.resolve(&params).is_err());
    }

    #[test]
    fn greedy_slot_takes_the_remainder() {
        let plan = ParamPlan::new(vec![Slot::required("cmd"), Slot::greedy("rest", 0)]);
        let params = ["join", "#a,#b,#c"];
        let resolved = plan.resolve(&params).unwrap();
        assert_eq!(resolved.slot(1), vec!["#a,#b,#c".to_string()]);
    }

    #[test]
    fn splitting_extractor_key_value() {
        assert_eq!(split_key_value("server-time"), ("server-time".to_string(), None));
        assert_eq!(
            split_key_value("account-tag:value"),
            ("account-tag".to_string(), Some("value".to_string()))
        );
    }
}
