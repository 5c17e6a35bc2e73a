use std::cmp::max;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::str::FromStr;

use derive_more::{Add, AddAssign, Display, From, Sub};
use log::{debug, warn};
use num_enum::TryFromPrimitive;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::AggregationWarning;
use crate::registry::TagRegistry;
use crate::timeline::Timeline;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Add, Sub, AddAssign, From,
    Serialize,
)]
pub struct Timestamp(pub u64 /* ns */);

impl Timestamp {
    pub const fn from_us(microseconds: u64) -> Timestamp {
        Timestamp(microseconds * 1000)
    }
    pub const fn from_secs(seconds: u64) -> Timestamp {
        Timestamp(seconds * 1_000_000_000)
    }
    pub fn to_us(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
    pub fn to_secs(&self) -> f64 {
        self.0 as f64 / 1e9
    }
    pub fn saturating_sub(self, other: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Stored in nanoseconds, displayed in seconds at the trace's
        // microsecond resolution.
        let nanoseconds = self.0;
        let divisor = 1_000_000_000;
        write!(f, "{}.{:0>6}", nanoseconds / divisor, (nanoseconds % divisor) / 1000)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid timestamp {0:?}")]
pub struct ParseTimestampError(String);

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    /// Parses `seconds[.fraction]` exactly; digits past nanoseconds are
    /// dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimestampError(s.to_owned());
        let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
        if secs.is_empty()
            || !secs.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let secs: u64 = secs.parse().map_err(|_| err())?;
        let frac = &frac[..frac.len().min(9)];
        let mut nanos: u64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| err())?
        };
        for _ in frac.len()..9 {
            nanos *= 10;
        }
        secs.checked_mul(1_000_000_000)
            .and_then(|ns| ns.checked_add(nanos))
            .map(Timestamp)
            .ok_or_else(err)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TimestampVisitor {}
        impl<'de> Visitor<'de> for TimestampVisitor {
            type Value = Timestamp;
            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a timestamp in seconds")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_identifier(TimestampVisitor {})
    }
}

/// User and system CPU time consumed by a locale so far.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct CpuTime {
    pub user: Timestamp,
    pub sys: Timestamp,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
pub struct LocaleID(pub u32);

impl LocaleID {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
pub struct TaskID(pub u64);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
pub struct TagID(pub u32);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
pub struct FileID(pub u32);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
pub struct FuncID(pub u32);

/// Addresses a tag: the two reserved entries or a discovered (physical or
/// logical) index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TagRef {
    All,
    Start,
    Tag(TagID),
}

impl fmt::Display for TagRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagRef::All => write!(f, "All"),
            TagRef::Start => write!(f, "Start"),
            TagRef::Tag(tag_id) => write!(f, "tag {}", tag_id),
        }
    }
}

// Make sure this is up to date with the runtime's task creation codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum TaskKind {
    Local = 0,
    On = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum CommOp {
    Get,
    Put,
    Fork,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum CommMode {
    Blocking,
    NonBlocking,
    Strided,
    Fast,
}

/// Where in the program a communication was issued.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum CommSite {
    Line { file: FileID, line: u32 },
    Func(FuncID),
}

/// One communication. `src` and `dst` are the direction the data (or, for
/// forks, the request) travels, so a get issued on `l` against `r` has
/// `src = r, dst = l`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct CommRecord {
    pub time: Timestamp,
    pub task: TaskID,
    pub op: CommOp,
    pub mode: CommMode,
    pub src: LocaleID,
    pub dst: LocaleID,
    pub size: u64,
    pub site: CommSite,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    // The header line; `main_task` is the task that wrote it.
    Start { cpu: CpuTime, main_task: TaskID },
    Tag { cpu: CpuTime, tag_no: u32, name: String },
    Pause { cpu: CpuTime, tag_no: u32 },
    End { cpu: CpuTime },
    Task { task: TaskID, kind: u8, line: u32, file: FileID },
    BeginTask { task: TaskID },
    EndTask { task: TaskID },
    Comm(CommRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub time: Timestamp,
    pub locale: LocaleID,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileName {
    pub name: String,
    pub rel_to_home: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuncName {
    pub name: String,
    pub file: FileID,
    pub line: u32,
}

/// Activity a run attributes to one function. Forks name the function
/// they run; gets, puts and task creations are attributed to the function
/// whose definition most closely precedes them in the same file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FuncStats {
    /// Positions in `State::events`.
    pub events: Vec<usize>,
    pub num_on_tasks: u64,
    pub num_tasks: u64,
    pub num_gets: u64,
    pub num_puts: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Add, AddAssign, Serialize)]
pub struct CommStats {
    pub num_comms: u64,
    pub num_gets: u64,
    pub num_puts: u64,
    pub num_forks: u64,
    pub comm_size: u64,
}

impl CommStats {
    fn record(&mut self, comm: &CommRecord) {
        self.num_comms += 1;
        match comm.op {
            CommOp::Get => self.num_gets += 1,
            CommOp::Put => self.num_puts += 1,
            CommOp::Fork => self.num_forks += 1,
        }
        self.comm_size += comm.size;
    }

    pub fn is_empty(&self) -> bool {
        self.num_comms == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCreate {
    pub time: Timestamp,
    pub kind: TaskKind,
    pub line: u32,
    pub file: FileID,
}

/// A task as seen from one (tag, locale) scope. `begin == None` marks a
/// task that was already running when the scope opened.
#[derive(Debug, Clone, Default)]
pub struct TaskRecord {
    pub create: Option<TaskCreate>,
    pub begin: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub end_tag: Option<TagRef>,
    pub task_clock: Timestamp,
    pub comms: Vec<CommRecord>,
    pub comm_sum: CommStats,
}

impl TaskRecord {
    pub fn is_running(&self) -> bool {
        self.begin.is_some() && self.end.is_none()
    }

    pub fn is_preexisting(&self) -> bool {
        self.begin.is_none()
    }

    fn merge(&mut self, other: &TaskRecord) {
        self.create = self.create.or(other.create);
        self.begin = self.begin.or(other.begin);
        self.end = other.end.or(self.end);
        self.end_tag = other.end_tag.or(self.end_tag);
        if let (Some(begin), Some(end)) = (self.begin, self.end) {
            self.task_clock = end.saturating_sub(begin);
        }
        self.comms.extend_from_slice(&other.comms);
        self.comm_sum += other.comm_sum;
    }
}

/// The program's main task on locale 0. It has no begin marker, so it
/// runs from the locale's start to its end.
#[derive(Debug, Clone)]
pub struct MainTask {
    pub locale: LocaleID,
    pub task: TaskID,
    pub record: TaskRecord,
}

impl MainTask {
    fn finish(&mut self, time: Timestamp, tag: Option<TagRef>) {
        if self.record.end.is_some() {
            return;
        }
        self.record.end = Some(time);
        self.record.end_tag = tag;
        if let Some(begin) = self.record.begin {
            self.record.task_clock = time.saturating_sub(begin);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocaleStats {
    pub user_cpu: Timestamp,
    pub sys_cpu: Timestamp,
    pub cpu: Timestamp,
    pub ref_user_cpu: Timestamp,
    pub ref_sys_cpu: Timestamp,
    pub clock_time: Timestamp,
    pub ref_time: Timestamp,
    pub max_task_clock: Timestamp,
    pub num_tasks: u64,
    pub run_conc: u64,
    pub max_conc: u64,
    pub tasks: BTreeMap<TaskID, TaskRecord>,
    open: bool,
    opened: bool,
}

impl LocaleStats {
    fn set_reference(&mut self, time: Timestamp, cpu: CpuTime) {
        self.ref_time = time;
        self.ref_user_cpu = cpu.user;
        self.ref_sys_cpu = cpu.sys;
        self.open = true;
        self.opened = true;
    }

    /// Accumulates time since the reference. Without a CPU sample only the
    /// clock advances.
    fn close(&mut self, time: Timestamp, cpu: Option<CpuTime>) {
        if !self.open {
            return;
        }
        if let Some(cpu) = cpu {
            self.user_cpu += cpu.user.saturating_sub(self.ref_user_cpu);
            self.sys_cpu += cpu.sys.saturating_sub(self.ref_sys_cpu);
            self.cpu = self.user_cpu + self.sys_cpu;
        }
        self.clock_time += time.saturating_sub(self.ref_time);
        self.open = false;
    }

    fn begin_task(&mut self, task: TaskID, time: Timestamp, create: Option<TaskCreate>) {
        self.tasks.insert(
            task,
            TaskRecord {
                create,
                begin: Some(time),
                ..Default::default()
            },
        );
        self.num_tasks += 1;
        self.run_conc += 1;
        self.max_conc = max(self.max_conc, self.run_conc);
    }

    fn end_task(&mut self, task: TaskID, time: Timestamp) -> &mut TaskRecord {
        let record = self.tasks.entry(task).or_default();
        if let Some(begin) = record.begin {
            record.task_clock = time.saturating_sub(begin);
            self.max_task_clock = max(self.max_task_clock, record.task_clock);
        }
        record.end = Some(time);
        self.run_conc = self.run_conc.saturating_sub(1);
        record
    }

    fn merge(&mut self, other: &LocaleStats) {
        self.user_cpu += other.user_cpu;
        self.sys_cpu += other.sys_cpu;
        self.cpu += other.cpu;
        self.clock_time += other.clock_time;
        self.max_task_clock = max(self.max_task_clock, other.max_task_clock);
        self.num_tasks += other.num_tasks;
        self.max_conc = max(self.max_conc, other.max_conc);
        for (task, record) in &other.tasks {
            match self.tasks.entry(*task) {
                Entry::Vacant(entry) => {
                    entry.insert(record.clone());
                }
                Entry::Occupied(mut entry) => entry.get_mut().merge(record),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TagInstance {
    pub name: String,
    // None for the reserved and logical tags
    pub tag_no: Option<u32>,
    num_locales: usize,
    pub locales: Vec<LocaleStats>,
    // row-major, indexed [src * num_locales + dst]
    comms: Vec<CommStats>,

    // Local maxes, for scaling displays
    pub max_cpu: Timestamp,
    pub max_clock: Timestamp,
    pub max_tasks: u64,
    pub max_conc: u64,
    pub max_comms: u64,
    pub max_size: u64,

    open_locales: usize,
}

impl TagInstance {
    pub(crate) fn new(name: String, num_locales: usize) -> Self {
        TagInstance {
            name,
            tag_no: None,
            num_locales,
            locales: vec![LocaleStats::default(); num_locales],
            comms: vec![CommStats::default(); num_locales * num_locales],
            max_cpu: Timestamp(0),
            max_clock: Timestamp(0),
            max_tasks: 0,
            max_conc: 0,
            max_comms: 0,
            max_size: 0,
            open_locales: 0,
        }
    }

    pub fn num_locales(&self) -> usize {
        self.num_locales
    }

    pub fn locale(&self, locale: LocaleID) -> Option<&LocaleStats> {
        self.locales.get(locale.index())
    }

    /// Traffic flowing from `src` to `dst` within this tag.
    pub fn comm(&self, src: LocaleID, dst: LocaleID) -> Option<&CommStats> {
        if src.index() >= self.num_locales || dst.index() >= self.num_locales {
            return None;
        }
        self.comms.get(src.index() * self.num_locales + dst.index())
    }

    pub fn comm_row(&self, src: LocaleID) -> Option<&[CommStats]> {
        let start = src.index().checked_mul(self.num_locales)?;
        self.comms.get(start..start + self.num_locales)
    }

    pub fn total_comms(&self) -> CommStats {
        self.comms
            .iter()
            .fold(CommStats::default(), |acc, cell| acc + *cell)
    }

    fn record_comm(&mut self, issuer: LocaleID, comm: &CommRecord) {
        if let Some(task) = self.locales[issuer.index()].tasks.get_mut(&comm.task) {
            if task.is_running() {
                task.comms.push(*comm);
                task.comm_sum.record(comm);
            }
        }
        let cell = comm.src.index() * self.num_locales + comm.dst.index();
        self.comms[cell].record(comm);
    }

    fn open(&mut self, locale: LocaleID, time: Timestamp, cpu: CpuTime, running: u64) {
        let stats = &mut self.locales[locale.index()];
        stats.set_reference(time, cpu);
        stats.run_conc = running;
        stats.max_conc = max(stats.max_conc, running);
        self.open_locales += 1;
    }

    /// Returns true once no locale has the tag open any more.
    fn close(&mut self, locale: LocaleID, time: Timestamp, cpu: Option<CpuTime>) -> bool {
        let stats = &mut self.locales[locale.index()];
        if stats.open {
            stats.close(time, cpu);
            self.open_locales = self.open_locales.saturating_sub(1);
        }
        self.open_locales == 0
    }

    pub(crate) fn finalize(&mut self) {
        self.max_cpu = self.locales.iter().map(|l| l.cpu).max().unwrap_or_default();
        self.max_clock = self
            .locales
            .iter()
            .map(|l| l.clock_time)
            .max()
            .unwrap_or_default();
        self.max_tasks = self.locales.iter().map(|l| l.num_tasks).max().unwrap_or(0);
        self.max_conc = self.locales.iter().map(|l| l.max_conc).max().unwrap_or(0);
        self.max_comms = self.comms.iter().map(|c| c.num_comms).max().unwrap_or(0);
        self.max_size = self.comms.iter().map(|c| c.comm_size).max().unwrap_or(0);
    }

    pub(crate) fn merge(&mut self, other: &TagInstance) {
        assert_eq!(self.num_locales, other.num_locales);
        for (mine, theirs) in self.locales.iter_mut().zip(&other.locales) {
            mine.merge(theirs);
        }
        for (mine, theirs) in self.comms.iter_mut().zip(&other.comms) {
            *mine += *theirs;
        }
    }
}

#[derive(Debug)]
struct LocaleCursor {
    scope: Option<TagRef>,
    last_time: Timestamp,
    ended: bool,
    created: BTreeMap<TaskID, TaskCreate>,
}

impl LocaleCursor {
    fn new() -> Self {
        LocaleCursor {
            scope: None,
            last_time: Timestamp(0),
            ended: false,
            created: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct State {
    num_locales: usize,
    events: Vec<Event>,
    pub tags: TagRegistry,
    files: BTreeMap<FileID, FileName>,
    funcs: BTreeMap<FuncID, FuncName>,
    // definition site -> function, for attributing line-tagged events
    func_lines: BTreeMap<(FileID, u32), FuncID>,
    func_stats: BTreeMap<FuncID, FuncStats>,
    main_task: Option<MainTask>,
    warnings: Vec<AggregationWarning>,
}

impl State {
    /// Builds the model from an already merged, time-ordered event sequence.
    pub fn from_events(
        num_locales: usize,
        events: Vec<Event>,
        files: BTreeMap<FileID, FileName>,
        funcs: BTreeMap<FuncID, FuncName>,
    ) -> Self {
        let func_lines = funcs
            .iter()
            .map(|(id, func)| ((func.file, func.line), *id))
            .collect();
        let mut state = State {
            num_locales,
            events: Vec::new(),
            tags: TagRegistry::new(num_locales),
            files,
            funcs,
            func_lines,
            func_stats: BTreeMap::new(),
            main_task: None,
            warnings: Vec::new(),
        };
        state.process_events(&events);
        state.events = events;
        state
    }

    fn warn(&mut self, warning: AggregationWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn process_events(&mut self, events: &[Event]) {
        let mut cursors: Vec<_> = (0..self.num_locales).map(|_| LocaleCursor::new()).collect();
        for (index, event) in events.iter().enumerate() {
            let Some(cursor) = cursors.get_mut(event.locale.index()) else {
                // The loader only produces events for loaded locales.
                debug!("dropping event from unknown locale {}", event.locale);
                continue;
            };
            cursor.last_time = event.time;
            self.process_event(index, event, cursor);
        }

        // Anything still open is implicitly closed at the locale's last event.
        for (index, cursor) in cursors.iter().enumerate() {
            let locale = LocaleID(index as u32);
            if let Some(scope) = cursor.scope {
                self.tags
                    .instance_mut(scope)
                    .close(locale, cursor.last_time, None);
            }
            if !cursor.ended {
                self.tags
                    .instance_mut(TagRef::All)
                    .close(locale, cursor.last_time, None);
            }
            if let Some(main) = self.main_task.as_mut().filter(|m| m.locale == locale) {
                main.finish(cursor.last_time, cursor.scope);
            }
        }
        self.tags.finish();
    }

    fn close_scope(
        &mut self,
        locale: LocaleID,
        cursor: &mut LocaleCursor,
        time: Timestamp,
        cpu: CpuTime,
    ) {
        if let Some(scope) = cursor.scope.take() {
            let instance = self.tags.instance_mut(scope);
            if instance.close(locale, time, Some(cpu)) && scope != TagRef::Start {
                instance.finalize();
            }
        }
    }

    fn enclosing_function(&self, file: FileID, line: u32) -> Option<FuncID> {
        self.func_lines
            .range((file, 0)..=(file, line))
            .next_back()
            .map(|(_, func)| *func)
    }

    fn record_comm_function(&mut self, index: usize, comm: &CommRecord) {
        let func = match comm.site {
            CommSite::Func(func) => Some(func),
            CommSite::Line { file, line } => self.enclosing_function(file, line),
        };
        let Some(func) = func else {
            return;
        };
        let stats = self.func_stats.entry(func).or_default();
        stats.events.push(index);
        match comm.op {
            CommOp::Get => stats.num_gets += 1,
            CommOp::Put => stats.num_puts += 1,
            CommOp::Fork => stats.num_on_tasks += 1,
        }
    }

    /// Comms of the main task, which no begin marker ever opened.
    fn record_main_comm(&mut self, locale: LocaleID, comm: &CommRecord) {
        let all = &self.tags.instance(TagRef::All).locales[locale.index()];
        if all.tasks.get(&comm.task).is_some_and(TaskRecord::is_running) {
            return;
        }
        if let Some(main) = self
            .main_task
            .as_mut()
            .filter(|m| m.locale == locale && m.task == comm.task && m.record.end.is_none())
        {
            main.record.comms.push(*comm);
            main.record.comm_sum.record(comm);
        }
    }

    fn process_event(&mut self, index: usize, event: &Event, cursor: &mut LocaleCursor) {
        let (time, locale) = (event.time, event.locale);
        match &event.kind {
            EventKind::Start { cpu, main_task } => {
                if locale == LocaleID(0) {
                    self.main_task = Some(MainTask {
                        locale,
                        task: *main_task,
                        record: TaskRecord {
                            begin: Some(time),
                            ..Default::default()
                        },
                    });
                }
                self.tags
                    .instance_mut(TagRef::All)
                    .locales[locale.index()]
                    .set_reference(time, *cpu);
                self.tags.instance_mut(TagRef::Start).open(locale, time, *cpu, 0);
                cursor.scope = Some(TagRef::Start);
            }
            EventKind::Tag { cpu, tag_no, name } => {
                if let Some(tag_id) = self.tags.tag_id(*tag_no) {
                    let instance = self.tags.instance(TagRef::Tag(tag_id));
                    if instance.locales[locale.index()].opened {
                        self.warn(AggregationWarning::DuplicateTagStart {
                            time,
                            locale,
                            tag_no: *tag_no,
                        });
                        return;
                    }
                    if instance.name != *name {
                        let expected = instance.name.clone();
                        self.warn(AggregationWarning::TagNameMismatch {
                            time,
                            locale,
                            tag_no: *tag_no,
                            expected,
                            found: name.clone(),
                        });
                    }
                }
                self.close_scope(locale, cursor, time, *cpu);
                let tag_id = self.tags.start(*tag_no, name);
                let running = self.tags.instance(TagRef::All).locales[locale.index()].run_conc;
                self.tags
                    .instance_mut(TagRef::Tag(tag_id))
                    .open(locale, time, *cpu, running);
                cursor.scope = Some(TagRef::Tag(tag_id));
            }
            EventKind::Pause { cpu, tag_no } => {
                let tag_id = self.tags.tag_id(*tag_no);
                match (tag_id, cursor.scope) {
                    (Some(tag_id), Some(TagRef::Tag(open))) if tag_id == open => {
                        self.close_scope(locale, cursor, time, *cpu);
                    }
                    _ => self.warn(AggregationWarning::UnmatchedPause {
                        time,
                        locale,
                        tag_no: *tag_no,
                    }),
                }
            }
            EventKind::End { cpu } => {
                if let Some(main) = self.main_task.as_mut().filter(|m| m.locale == locale) {
                    main.finish(time, cursor.scope);
                }
                self.close_scope(locale, cursor, time, *cpu);
                self.tags
                    .instance_mut(TagRef::All)
                    .locales[locale.index()]
                    .close(time, Some(*cpu));
                cursor.ended = true;
            }
            EventKind::Task {
                task,
                kind,
                line,
                file,
            } => match TaskKind::try_from(*kind) {
                Ok(kind) => {
                    cursor.created.insert(
                        *task,
                        TaskCreate {
                            time,
                            kind,
                            line: *line,
                            file: *file,
                        },
                    );
                    if let Some(func) = self.enclosing_function(*file, *line) {
                        let stats = self.func_stats.entry(func).or_default();
                        stats.events.push(index);
                        stats.num_tasks += 1;
                    }
                }
                Err(_) => self.warn(AggregationWarning::BadTaskKind {
                    time,
                    locale,
                    task: *task,
                    kind: *kind,
                }),
            },
            EventKind::BeginTask { task } => {
                let all = &self.tags.instance(TagRef::All).locales[locale.index()];
                if all.tasks.get(task).is_some_and(|t| t.begin.is_some()) {
                    self.warn(AggregationWarning::DuplicateTaskBegin {
                        time,
                        locale,
                        task: *task,
                    });
                    return;
                }
                let create = cursor.created.remove(task);
                for scope in scopes(cursor.scope) {
                    self.tags.instance_mut(scope).locales[locale.index()]
                        .begin_task(*task, time, create);
                }
            }
            EventKind::EndTask { task } => {
                let all = &self.tags.instance(TagRef::All).locales[locale.index()];
                if all.tasks.get(task).is_some_and(|t| t.end.is_some()) {
                    self.warn(AggregationWarning::DuplicateTaskEnd {
                        time,
                        locale,
                        task: *task,
                    });
                    return;
                }
                for scope in scopes(cursor.scope) {
                    let record = self.tags.instance_mut(scope).locales[locale.index()]
                        .end_task(*task, time);
                    if scope == TagRef::All {
                        record.end_tag = cursor.scope;
                    }
                }
            }
            EventKind::Comm(comm) => {
                for remote in [comm.src, comm.dst] {
                    if remote.index() >= self.num_locales {
                        self.warn(AggregationWarning::LocaleOutOfRange {
                            time,
                            locale,
                            remote,
                            num_locales: self.num_locales,
                        });
                        return;
                    }
                }
                self.record_main_comm(locale, comm);
                for scope in scopes(cursor.scope) {
                    self.tags.instance_mut(scope).record_comm(locale, comm);
                }
                self.record_comm_function(index, comm);
            }
        }
    }

    pub fn num_locales(&self) -> usize {
        self.num_locales
    }

    pub fn tag_count(&self) -> usize {
        self.tags.tag_count()
    }

    pub fn logical_tag_count(&self) -> usize {
        self.tags.logical_tag_count()
    }

    pub fn has_unique_tags(&self) -> bool {
        self.tags.has_unique_tags()
    }

    pub fn get_tag_data(&self, tag: TagRef) -> Option<&TagInstance> {
        self.tags.get(tag)
    }

    pub fn get_logical_tag_data(&self, tag: TagRef) -> Option<&TagInstance> {
        self.tags.get_logical(tag)
    }

    /// Looks a task up in one (tag, locale) scope; `TagRef::All` sees every
    /// task of the run.
    pub fn get_task_data(
        &self,
        locale: LocaleID,
        task: TaskID,
        tag: TagRef,
    ) -> Option<&TaskRecord> {
        self.tags.get(tag)?.locale(locale)?.tasks.get(&task)
    }

    pub fn main_task(&self) -> Option<&MainTask> {
        self.main_task.as_ref()
    }

    pub fn file_name(&self, file: FileID) -> Option<&str> {
        self.files.get(&file).map(|f| f.name.as_str())
    }

    pub fn file_is_relative_to_home(&self, file: FileID) -> Option<bool> {
        self.files.get(&file).map(|f| f.rel_to_home)
    }

    pub fn function(&self, func: FuncID) -> Option<&FuncName> {
        self.funcs.get(&func)
    }

    pub fn function_stats(&self, func: FuncID) -> Option<&FuncStats> {
        self.func_stats.get(&func)
    }

    /// Functions with any attributed activity, in id order.
    pub fn function_stats_iter(&self) -> impl Iterator<Item = (FuncID, &FuncStats)> {
        self.func_stats.iter().map(|(id, stats)| (*id, stats))
    }

    pub fn function_events(&self, func: FuncID) -> impl Iterator<Item = &Event> {
        self.func_stats
            .get(&func)
            .into_iter()
            .flat_map(|stats| stats.events.iter().filter_map(|i| self.events.get(*i)))
    }

    pub fn start_clock(&self) -> Option<Timestamp> {
        self.events.first().map(|e| e.time)
    }

    pub fn last_clock(&self) -> Option<Timestamp> {
        self.events.last().map(|e| e.time)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn warnings(&self) -> &[AggregationWarning] {
        &self.warnings
    }

    pub fn timeline(&self, locale: LocaleID) -> Timeline<'_> {
        Timeline::new(&self.events, locale, &self.tags)
    }
}

/// Scopes an event on a locale updates: always `TagAll`, plus the locale's
/// open tag (or `TagStart`) if any.
fn scopes(current: Option<TagRef>) -> impl Iterator<Item = TagRef> {
    std::iter::once(TagRef::All).chain(current)
}
