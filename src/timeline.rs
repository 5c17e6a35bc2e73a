use std::slice;

use serde::Serialize;

use crate::registry::TagRegistry;
use crate::state::{Event, EventKind, LocaleID, TagID, TaskID, Timestamp};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TimelineKind {
    TagEnter(TagID),
    TaskBegin(TaskID),
    TaskEnd(TaskID),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub time: Timestamp,
    pub kind: TimelineKind,
}

/// Tag entries and task begins/ends on one locale, in merged order.
/// Derived from the event sequence on every pass; clone to restart.
#[derive(Debug, Clone)]
pub struct Timeline<'a> {
    events: slice::Iter<'a, Event>,
    locale: LocaleID,
    tags: &'a TagRegistry,
}

impl<'a> Timeline<'a> {
    pub(crate) fn new(events: &'a [Event], locale: LocaleID, tags: &'a TagRegistry) -> Self {
        Timeline {
            events: events.iter(),
            locale,
            tags,
        }
    }

    pub fn locale(&self) -> LocaleID {
        self.locale
    }

    /// Running task count after each begin or end.
    pub fn concurrency(self) -> Vec<(Timestamp, u64)> {
        let mut running = 0u64;
        self.filter_map(|entry| {
            match entry.kind {
                TimelineKind::TaskBegin(_) => running += 1,
                TimelineKind::TaskEnd(_) => running = running.saturating_sub(1),
                TimelineKind::TagEnter(_) => return None,
            }
            Some((entry.time, running))
        })
        .collect()
    }
}

impl Iterator for Timeline<'_> {
    type Item = TimelineEntry;

    fn next(&mut self) -> Option<TimelineEntry> {
        for event in self.events.by_ref() {
            if event.locale != self.locale {
                continue;
            }
            let kind = match &event.kind {
                EventKind::Tag { tag_no, .. } => match self.tags.tag_id(*tag_no) {
                    Some(tag_id) => TimelineKind::TagEnter(tag_id),
                    None => continue,
                },
                EventKind::BeginTask { task } => TimelineKind::TaskBegin(*task),
                EventKind::EndTask { task } => TimelineKind::TaskEnd(*task),
                _ => continue,
            };
            return Some(TimelineEntry {
                time: event.time,
                kind,
            });
        }
        None
    }
}
