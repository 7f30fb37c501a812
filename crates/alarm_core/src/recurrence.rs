use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime};

use crate::config::MAX_HORIZON;
use crate::model::{AlarmDefinition, RepeatRule};

/// `count` is caller-supplied; only this much is reserved up front.
const PREALLOCATE_LIMIT: usize = MAX_HORIZON * 4;

/// Next `count` fire instants of `definition` at or after `reference`,
/// in ascending order.
///
/// Pure computation: the same arguments always produce the same output and
/// no instant is ever earlier than `reference`. Business limits on `count`
/// are the caller's concern. A definition that fails validation yields no
/// occurrences.
pub fn next_occurrences(
    definition: &AlarmDefinition,
    reference: NaiveDateTime,
    count: usize,
) -> Vec<NaiveDateTime> {
    if count == 0 {
        return Vec::new();
    }
    let Some(time) = definition.time.to_naive_time() else {
        return Vec::new();
    };

    match &definition.repeat_rule {
        RepeatRule::None => once(reference, time).into_iter().collect(),
        RepeatRule::DaysOfWeek { days } => {
            weekly(reference, time, count, |date| days.contains(&date.weekday()))
        }
        RepeatRule::Interval { every_days, anchor } => {
            every_n_days(reference, time, count, *every_days, *anchor)
        }
    }
}

pub fn next_occurrence(
    definition: &AlarmDefinition,
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    next_occurrences(definition, reference, 1).into_iter().next()
}

fn once(reference: NaiveDateTime, time: NaiveTime) -> Option<NaiveDateTime> {
    let today = reference.date().and_time(time);
    if today >= reference {
        return Some(today);
    }
    reference
        .date()
        .checked_add_days(Days::new(1))
        .map(|tomorrow| tomorrow.and_time(time))
}

fn weekly(
    reference: NaiveDateTime,
    time: NaiveTime,
    count: usize,
    matches: impl Fn(NaiveDate) -> bool,
) -> Vec<NaiveDateTime> {
    let mut out = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
    // A non-empty weekday set hits at least once per week.
    let max_days = (count as u64).saturating_add(1).saturating_mul(7);
    let mut date = reference.date();
    for _ in 0..=max_days {
        if matches(date) {
            let candidate = date.and_time(time);
            if candidate >= reference {
                out.push(candidate);
                if out.len() == count {
                    break;
                }
            }
        }
        let Some(next) = date.checked_add_days(Days::new(1)) else {
            break;
        };
        date = next;
    }
    out
}

fn every_n_days(
    reference: NaiveDateTime,
    time: NaiveTime,
    count: usize,
    every_days: u32,
    anchor: NaiveDate,
) -> Vec<NaiveDateTime> {
    if every_days == 0 {
        return Vec::new();
    }
    let step = i64::from(every_days);
    let elapsed = (reference.date() - anchor).num_days();
    let periods = if elapsed <= 0 {
        0
    } else {
        (elapsed + step - 1) / step
    };

    let Some(mut date) = anchor.checked_add_days(Days::new((periods * step) as u64)) else {
        return Vec::new();
    };
    if date.and_time(time) < reference {
        match date.checked_add_days(Days::new(step as u64)) {
            Some(next) => date = next,
            None => return Vec::new(),
        }
    }

    let mut out = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
    while out.len() < count {
        out.push(date.and_time(time));
        match date.checked_add_days(Days::new(step as u64)) {
            Some(next) => date = next,
            None => break,
        }
    }
    out
}
