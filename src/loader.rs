use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;

use crate::error::LoadError;
use crate::serialize::{DataComm, ForkComm, Header, LocaleLog, Record, deserialize};
use crate::state::{
    CommMode, CommOp, CommRecord, CommSite, CpuTime, Event, EventKind, FileID, FileName, FuncID,
    FuncName, LocaleID, State, Timestamp,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Find `<stem>-<n>` files by listing the directory instead of trusting
    /// the node count in `<basename>-0`.
    pub discover: bool,
    pub parallel: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            discover: false,
            parallel: true,
            verbose: false,
        }
    }
}

/// One locale's decoded events plus the symbols its file defines.
#[derive(Debug, Default)]
struct LocaleStream {
    events: Vec<Event>,
    files: Vec<(FileID, FileName)>,
    funcs: Vec<(FuncID, FuncName)>,
}

fn locale_path(basename: &Path, locale: u32) -> PathBuf {
    let mut name = basename.as_os_str().to_owned();
    name.push(format!("-{}", locale));
    PathBuf::from(name)
}

/// Canonical decimal suffix only, so `E-01` and `E-1` cannot both claim
/// locale 1.
fn parse_suffix(name: &str, stem: &str) -> Option<u32> {
    let suffix = name.strip_prefix(stem)?.strip_prefix('-')?;
    if suffix.is_empty()
        || !suffix.bytes().all(|b| b.is_ascii_digit())
        || (suffix.len() > 1 && suffix.starts_with('0'))
    {
        return None;
    }
    suffix.parse().ok()
}

fn discover_files(basename: &Path) -> Result<Vec<(LocaleID, PathBuf)>, LoadError> {
    let dir = match basename.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let stem = basename
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_owned();
    let io_error = |source| LoadError::Io {
        path: dir.to_owned(),
        source,
    };

    let mut found = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        let name = entry.file_name();
        if let Some(locale) = name.to_str().and_then(|n| parse_suffix(n, &stem)) {
            found.push((LocaleID(locale), entry.path()));
        }
    }
    if found.is_empty() {
        return Err(LoadError::NoTraceFiles {
            dir: dir.to_owned(),
            stem,
        });
    }
    found.sort();
    Ok(found)
}

fn convert_comm(locale: LocaleID, comm: DataComm, op: CommOp, mode: CommMode) -> CommRecord {
    // Gets move data from the remote locale to the issuer.
    let (src, dst) = match op {
        CommOp::Get => (comm.remote, locale),
        CommOp::Put | CommOp::Fork => (locale, comm.remote),
    };
    CommRecord {
        time: comm.time,
        task: comm.task,
        op,
        mode,
        src,
        dst,
        size: comm.size,
        site: CommSite::Line {
            file: comm.file,
            line: comm.line,
        },
    }
}

fn convert_fork(locale: LocaleID, comm: ForkComm, mode: CommMode) -> CommRecord {
    CommRecord {
        time: comm.time,
        task: comm.task,
        op: CommOp::Fork,
        mode,
        src: locale,
        dst: comm.remote,
        size: comm.arg_size,
        site: CommSite::Func(comm.func),
    }
}

fn convert_record(locale: LocaleID, record: Record) -> Option<EventKind> {
    use CommMode::*;
    use CommOp::*;
    let kind = match record {
        Record::BeginTask { task, .. } => EventKind::BeginTask { task },
        Record::EndTask { task, .. } => EventKind::EndTask { task },
        Record::Get(c) => EventKind::Comm(convert_comm(locale, c, Get, Blocking)),
        Record::Put(c) => EventKind::Comm(convert_comm(locale, c, Put, Blocking)),
        Record::NbGet(c) => EventKind::Comm(convert_comm(locale, c, Get, NonBlocking)),
        Record::NbPut(c) => EventKind::Comm(convert_comm(locale, c, Put, NonBlocking)),
        Record::StGet(c) => EventKind::Comm(convert_comm(locale, c, Get, Strided)),
        Record::StPut(c) => EventKind::Comm(convert_comm(locale, c, Put, Strided)),
        Record::Fork(c) => EventKind::Comm(convert_fork(locale, c, Blocking)),
        Record::ForkNb(c) => EventKind::Comm(convert_fork(locale, c, NonBlocking)),
        Record::FastFork(c) => EventKind::Comm(convert_fork(locale, c, Fast)),
        Record::Task {
            task,
            kind,
            line,
            file,
            ..
        } => EventKind::Task {
            task,
            kind,
            line,
            file,
        },
        Record::Tag {
            user,
            sys,
            tag_no,
            name,
            ..
        } => EventKind::Tag {
            cpu: CpuTime { user, sys },
            tag_no,
            name,
        },
        Record::Pause {
            user, sys, tag_no, ..
        } => EventKind::Pause {
            cpu: CpuTime { user, sys },
            tag_no,
        },
        Record::End { user, sys, .. } => EventKind::End {
            cpu: CpuTime { user, sys },
        },
        Record::FileName { .. } | Record::FuncName { .. } => return None,
    };
    Some(kind)
}

fn into_stream(log: LocaleLog) -> Result<LocaleStream, LoadError> {
    let locale = log.header.nid;
    let mut stream = LocaleStream::default();
    stream.events.reserve(log.records.len() + 1);
    stream.events.push(Event {
        time: log.header.clock,
        locale,
        kind: EventKind::Start {
            cpu: log.header.cpu,
            main_task: log.header.tid,
        },
    });

    let mut previous = log.header.clock;
    for (line, record) in log.records {
        match record {
            Record::FileName {
                file,
                rel_to_home,
                name,
            } => stream.files.push((file, FileName { name, rel_to_home })),
            Record::FuncName {
                func,
                line,
                file,
                name,
            } => stream.funcs.push((func, FuncName { name, file, line })),
            record => {
                let time = record.time().unwrap_or(previous);
                if time < previous {
                    return Err(LoadError::NonMonotonic {
                        path: log.path,
                        line,
                        time,
                        previous,
                    });
                }
                previous = time;
                if let Some(kind) = convert_record(locale, record) {
                    stream.events.push(Event { time, locale, kind });
                }
            }
        }
    }
    Ok(stream)
}

/// Checks a decoded file against the locale its name claims and the node
/// count and sequence of the run.
fn validate(log: &LocaleLog, expected: LocaleID, run: &Header) -> Result<(), LoadError> {
    let header = &log.header;
    let nodes = run.nodes;
    if header.nid != expected {
        return Err(LoadError::LocaleMismatch {
            path: log.path.clone(),
            expected,
            found: header.nid,
        });
    }
    if header.nodes != nodes {
        return Err(LoadError::NodeCountMismatch {
            path: log.path.clone(),
            expected: nodes,
            found: header.nodes,
        });
    }
    if header.nid.0 >= nodes {
        return Err(LoadError::LocaleOutOfRange {
            path: log.path.clone(),
            locale: header.nid,
            nodes,
        });
    }
    if header.seq != run.seq {
        return Err(LoadError::RunMismatch {
            path: log.path.clone(),
            expected: run.seq,
            found: header.seq,
        });
    }
    Ok(())
}

fn decode_all(
    files: &[(LocaleID, PathBuf)],
    config: &Config,
) -> Result<Vec<(LocaleID, LocaleLog)>, LoadError> {
    let decode = |(locale, path): &(LocaleID, PathBuf)| {
        if config.verbose {
            println!("Reading log file {:?}...", path);
        }
        if !path.exists() {
            return Err(LoadError::MissingLocale {
                locale: *locale,
                path: path.clone(),
            });
        }
        deserialize(path).map(|log| (*locale, log))
    };
    if config.parallel {
        files.par_iter().map(decode).collect()
    } else {
        files.iter().map(decode).collect()
    }
}

/// Paths of locales `1..nodes` in count mode. Stops at the first absent
/// file so a bogus node count fails before anything is sized by it.
fn count_files(basename: &Path, nodes: u32) -> Result<Vec<(LocaleID, PathBuf)>, LoadError> {
    let mut files = Vec::new();
    for locale in (1..nodes).map(LocaleID) {
        let path = locale_path(basename, locale.0);
        if !path.exists() {
            return Err(LoadError::MissingLocale { locale, path });
        }
        files.push((locale, path));
    }
    Ok(files)
}

/// Merges per-locale streams into one sequence ordered by
/// `(time, locale, position in the locale's stream)`.
fn merge_streams(streams: Vec<Vec<Event>>) -> Vec<Event> {
    let total = streams.iter().map(Vec::len).sum();
    let mut result = Vec::with_capacity(total);
    let mut streams: Vec<_> = streams
        .into_iter()
        .map(|s| s.into_iter().peekable())
        .collect();

    // Hack: This is a max heap so reverse the values as they go in.
    let mut heap = BinaryHeap::<Reverse<(Timestamp, LocaleID, usize)>>::new();
    for (index, stream) in streams.iter_mut().enumerate() {
        if let Some(event) = stream.peek() {
            heap.push(Reverse((event.time, event.locale, index)));
        }
    }
    while let Some(Reverse((_, _, index))) = heap.pop() {
        let stream = &mut streams[index];
        if let Some(event) = stream.next() {
            result.push(event);
        }
        if let Some(next) = stream.peek() {
            heap.push(Reverse((next.time, next.locale, index)));
        }
    }
    debug!("merged {} events from {} locales", result.len(), streams.len());
    result
}

/// Loads every trace file of a run named by `basename` and aggregates it.
pub fn load_data<P: AsRef<Path>>(basename: P, discover: bool) -> Result<State, LoadError> {
    load_data_with(
        basename,
        &Config {
            discover,
            ..Config::default()
        },
    )
}

pub fn load_data_with<P: AsRef<Path>>(basename: P, config: &Config) -> Result<State, LoadError> {
    let basename = basename.as_ref();

    let logs = if config.discover {
        let files = discover_files(basename)?;
        info!("found {} trace files for {}", files.len(), basename.display());
        decode_all(&files, config)?
    } else {
        let mut logs = decode_all(&[(LocaleID(0), locale_path(basename, 0))], config)?;
        let nodes = logs.first().map_or(0, |(_, log)| log.header.nodes);
        let rest = count_files(basename, nodes)?;
        logs.extend(decode_all(&rest, config)?);
        logs
    };

    // The lowest numbered file sets the node count and run for the rest.
    let Some(run) = logs.first().map(|(_, log)| log.header.clone()) else {
        return Err(LoadError::MissingLocale {
            locale: LocaleID(0),
            path: locale_path(basename, 0),
        });
    };
    let nodes = run.nodes;
    info!("run {} has {} locales", run.seq, nodes);
    for (locale, log) in &logs {
        validate(log, *locale, &run)?;
    }
    // Files are sorted and unique, so a gap shows up as the first position
    // whose locale is ahead of it.
    let missing = (0..nodes)
        .map(LocaleID)
        .zip(
            logs.iter()
                .map(|(locale, _)| Some(*locale))
                .chain(std::iter::repeat(None)),
        )
        .find(|(expected, found)| *found != Some(*expected))
        .map(|(expected, _)| expected);
    if let Some(locale) = missing {
        return Err(LoadError::MissingLocale {
            locale,
            path: locale_path(basename, locale.0),
        });
    }

    let logs = logs.into_iter().map(|(_, log)| log);
    let streams: Vec<LocaleStream> = if config.parallel {
        logs.collect::<Vec<_>>()
            .into_par_iter()
            .map(into_stream)
            .collect::<Result<_, _>>()?
    } else {
        logs.map(into_stream).collect::<Result<_, _>>()?
    };

    let mut files = BTreeMap::new();
    let mut funcs = BTreeMap::new();
    let mut events = Vec::with_capacity(streams.len());
    for stream in streams {
        for (id, file) in stream.files {
            files.entry(id).or_insert(file);
        }
        for (id, func) in stream.funcs {
            funcs.entry(id).or_insert(func);
        }
        events.push(stream.events);
    }

    let num_locales = events.len();
    let events = merge_streams(events);
    info!("aggregating {} events over {} locales", events.len(), num_locales);
    Ok(State::from_events(num_locales, events, files, funcs))
}
