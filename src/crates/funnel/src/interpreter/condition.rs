//! Condition node evaluation
//!
//! Pure functions over the tenant-local calendar; the interpreter supplies the
//! conversation labels and the current time.

use crate::graph::{ZoneAction, HANDLE_FALSE, HANDLE_TRUE};
use crate::text;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, TimeZone, Utc, Weekday};

/// Outcome of evaluating a condition node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    /// Take the edge carrying this handle
    Follow(&'static str),
    /// End the path
    Stop,
    /// Suspend and evaluate the same node again at this instant
    WaitUntil(DateTime<Utc>),
}

/// Zones of a datetime range, also the handles followed from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Before,
    Between,
    After,
}

impl Zone {
    pub fn handle(&self) -> &'static str {
        match self {
            Zone::Before => "before",
            Zone::Between => "between",
            Zone::After => "after",
        }
    }
}

fn handle_for(holds: bool) -> &'static str {
    if holds {
        HANDLE_TRUE
    } else {
        HANDLE_FALSE
    }
}

/// `true` handle when any label equals `tag` ignoring case and diacritics
pub fn evaluate_tag(tag: &str, labels: &[String]) -> Branch {
    let wanted = text::fold(tag);
    Branch::Follow(handle_for(labels.iter().any(|label| text::fold(label) == wanted)))
}

/// `true` handle when the tenant-local day of `now` is listed
pub fn evaluate_weekday(days: &[Weekday], now: DateTime<Utc>, offset: FixedOffset) -> Branch {
    let today = now.with_timezone(&offset).weekday();
    Branch::Follow(handle_for(days.contains(&today)))
}

/// Which zone of `[start, end)` the tenant-local time falls in
pub fn zone_of(start: NaiveDateTime, end: NaiveDateTime, now: DateTime<Utc>, offset: FixedOffset) -> Zone {
    let local = now.with_timezone(&offset).naive_local();
    if local < start {
        Zone::Before
    } else if local < end {
        Zone::Between
    } else {
        Zone::After
    }
}

/// Apply the configured action of the zone `now` falls in.
///
/// `wait` suspends until the zone ends: the range start while before it, the
/// range end while inside it. The after zone never ends, so waiting there stops.
pub fn evaluate_range(
    start: NaiveDateTime,
    end: NaiveDateTime,
    actions: (ZoneAction, ZoneAction, ZoneAction),
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Branch {
    let (before, between, after) = actions;
    let zone = zone_of(start, end, now, offset);
    let (action, boundary) = match zone {
        Zone::Before => (before, Some(start)),
        Zone::Between => (between, Some(end)),
        Zone::After => (after, None),
    };

    match action {
        ZoneAction::Follow => Branch::Follow(zone.handle()),
        ZoneAction::Stop => Branch::Stop,
        ZoneAction::Wait => match boundary.and_then(|at| offset.from_local_datetime(&at).single()) {
            Some(at) => Branch::WaitUntil(at.with_timezone(&Utc)),
            None => Branch::Stop,
        },
    }
}
