use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json;

use crate::backend::common::task_name;
use crate::state::{LocaleID, State, TagRef, Timestamp};
use crate::timeline::TimelineKind;

#[derive(Serialize, Copy, Clone)]
struct Args {
    running: u64,
}

#[derive(Serialize, Copy, Clone)]
struct Event<'a> {
    name: &'a str,
    #[serde(rename = "cat")]
    category: &'a str,
    #[serde(rename = "ph")]
    phase: &'a str,
    #[serde(rename = "ts")]
    timestamp: f64,
    #[serde(rename = "dur", skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    scope: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Args>,
    pid: u32,
    tid: u64,
}

struct TraceWriter<W: Write> {
    out: W,
    first: bool,
}

impl<W: Write> TraceWriter<W> {
    fn new(mut out: W) -> io::Result<Self> {
        write!(out, "[")?;
        Ok(TraceWriter { out, first: true })
    }

    fn event(&mut self, event: &Event) -> io::Result<()> {
        if !self.first {
            write!(self.out, ",")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.out, event)?;
        Ok(())
    }

    fn finish(mut self) -> io::Result<()> {
        writeln!(self.out, "]")
    }
}

/// Writes task spans, tag entries and concurrency counters in the Chrome
/// trace-viewer format. Times are relative to the start of the run.
pub fn write_trace<W: Write>(state: &State, out: W) -> io::Result<()> {
    let origin = state.start_clock().unwrap_or_default();
    let last = state.last_clock().unwrap_or_default();
    let rel = |time: Timestamp| time.saturating_sub(origin).to_us();
    let mut trace = TraceWriter::new(out)?;

    let Some(all) = state.get_tag_data(TagRef::All) else {
        return trace.finish();
    };
    for (index, stats) in all.locales.iter().enumerate() {
        let locale = LocaleID(index as u32);
        let default = Event {
            name: "",
            category: "task",
            phase: "X",
            timestamp: 0.0,
            duration: None,
            scope: None,
            args: None,
            pid: locale.0,
            tid: 0,
        };

        for (task, record) in &stats.tasks {
            // Tasks without a begin were never seen starting.
            let Some(begin) = record.begin else {
                continue;
            };
            let end = record.end.unwrap_or(last);
            let name = task_name(state, locale, *task, record);
            trace.event(&Event {
                name: &name,
                timestamp: rel(begin),
                duration: Some((end.saturating_sub(begin)).to_us()),
                tid: task.0,
                ..default
            })?;
        }

        let timeline = state.timeline(locale);
        for entry in timeline.clone() {
            if let TimelineKind::TagEnter(tag_id) = entry.kind {
                let name = state
                    .get_tag_data(TagRef::Tag(tag_id))
                    .map_or("", |t| t.name.as_str());
                trace.event(&Event {
                    name,
                    category: "tag",
                    phase: "i",
                    timestamp: rel(entry.time),
                    scope: Some("p"),
                    ..default
                })?;
            }
        }
        for (time, running) in timeline.concurrency() {
            trace.event(&Event {
                name: "concurrency",
                category: "concurrency",
                phase: "C",
                timestamp: rel(time),
                args: Some(Args { running }),
                ..default
            })?;
        }
    }

    trace.finish()
}

pub fn emit_trace<P: AsRef<Path>>(state: &State, path: P, force: bool) -> io::Result<()> {
    println!("Generating trace file {:?}", path.as_ref());

    let file = OpenOptions::new()
        .write(true)
        // If force is set, create and truncate.
        .create(true)
        .truncate(true)
        // If force is not set, create only if it does not exist.
        .create_new(!force)
        .open(path)?;
    write_trace(state, io::BufWriter::new(file))
}
