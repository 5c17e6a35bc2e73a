use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use nom::{
    IResult,
    bytes::complete::{tag, take_till1},
    character::complete::{digit1, space0, space1, u32, u64},
    combinator::{eof, map_res, opt, recognize},
    sequence::{pair, preceded, tuple},
};

use serde::Deserialize;

use crate::error::LoadError;
use crate::serde::ascii::from_str;
use crate::state::{CpuTime, FileID, FuncID, LocaleID, TaskID, Timestamp};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// First line of every trace file. Doubles as the locale's run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: String,
    pub nodes: u32,
    pub nid: LocaleID,
    pub tid: TaskID,
    // Run sequence; every file of one run carries the same value.
    pub seq: Timestamp,
    pub clock: Timestamp,
    pub cpu: CpuTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataComm {
    pub time: Timestamp,
    pub task: TaskID,
    pub remote: LocaleID,
    pub size: u64,
    pub line: u32,
    pub file: FileID,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForkComm {
    pub time: Timestamp,
    pub task: TaskID,
    pub remote: LocaleID,
    pub arg_size: u64,
    pub func: FuncID,
}

// Variants are tried in order, most frequent first.
#[rustfmt::skip]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum Record {
    #[serde(rename = "Btask:")]
    BeginTask { time: Timestamp, task: TaskID },
    #[serde(rename = "Etask:")]
    EndTask { time: Timestamp, task: TaskID },
    #[serde(rename = "get:")]
    Get(DataComm),
    #[serde(rename = "put:")]
    Put(DataComm),
    #[serde(rename = "nb_get:")]
    NbGet(DataComm),
    #[serde(rename = "nb_put:")]
    NbPut(DataComm),
    #[serde(rename = "st_get:")]
    StGet(DataComm),
    #[serde(rename = "st_put:")]
    StPut(DataComm),
    #[serde(rename = "fork:")]
    Fork(ForkComm),
    #[serde(rename = "fork_nb:")]
    ForkNb(ForkComm),
    #[serde(rename = "f_fork:")]
    FastFork(ForkComm),
    #[serde(rename = "task:")]
    Task { time: Timestamp, task: TaskID, kind: u8, line: u32, file: FileID },
    #[serde(rename = "Tag:")]
    Tag { time: Timestamp, user: Timestamp, sys: Timestamp, tag_no: u32, name: String },
    #[serde(rename = "Pause:")]
    Pause { time: Timestamp, user: Timestamp, sys: Timestamp, tag_no: u32 },
    #[serde(rename = "End:")]
    End { time: Timestamp, user: Timestamp, sys: Timestamp },
    #[serde(rename = "fname:")]
    FileName { file: FileID, rel_to_home: bool, name: String },
    #[serde(rename = "fid:")]
    FuncName { func: FuncID, line: u32, file: FileID, name: String },
}

impl Record {
    /// Clock time of the record; symbol table entries have none.
    pub fn time(&self) -> Option<Timestamp> {
        match self {
            Record::BeginTask { time, .. }
            | Record::EndTask { time, .. }
            | Record::Task { time, .. }
            | Record::Tag { time, .. }
            | Record::Pause { time, .. }
            | Record::End { time, .. } => Some(*time),
            Record::Get(comm)
            | Record::Put(comm)
            | Record::NbGet(comm)
            | Record::NbPut(comm)
            | Record::StGet(comm)
            | Record::StPut(comm) => Some(comm.time),
            Record::Fork(comm) | Record::ForkNb(comm) | Record::FastFork(comm) => Some(comm.time),
            Record::FileName { .. } | Record::FuncName { .. } => None,
        }
    }
}

/// One decoded trace file. Records keep their 1-based line numbers.
#[derive(Debug, Clone)]
pub struct LocaleLog {
    pub path: PathBuf,
    pub header: Header,
    pub records: Vec<(usize, Record)>,
}

fn parse_timestamp(input: &str) -> IResult<&str, Timestamp> {
    map_res(take_till1(|c: char| c.is_whitespace()), str::parse)(input)
}

fn parse_field<'a, O>(
    name: &'static str,
    value: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(tuple((space1, tag(name), space1)), value)
}

fn parse_header(input: &str) -> IResult<&str, Header> {
    let (input, _) = tag("ChplVdebug:")(input)?;
    let (input, version) = parse_field(
        "ver",
        recognize(pair(digit1, opt(pair(tag("."), digit1)))),
    )(input)?;
    let (input, nodes) = parse_field("nodes", u32)(input)?;
    let (input, nid) = parse_field("nid", u32)(input)?;
    let (input, tid) = parse_field("tid", u64)(input)?;
    let (input, seq) = parse_field("seq", parse_timestamp)(input)?;
    let (input, clock) = preceded(space1, parse_timestamp)(input)?;
    let (input, user) = preceded(space1, parse_timestamp)(input)?;
    let (input, sys) = preceded(space1, parse_timestamp)(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = eof(input)?;
    Ok((
        input,
        Header {
            version: version.to_owned(),
            nodes,
            nid: LocaleID(nid),
            tid: TaskID(tid),
            seq,
            clock,
            cpu: CpuTime { user, sys },
        },
    ))
}

fn read_contents(path: &Path) -> Result<Vec<u8>, LoadError> {
    let io_error = |source| LoadError::Io {
        path: path.to_owned(),
        source,
    };
    let raw = fs::read(path).map_err(io_error)?;
    if !raw.starts_with(&GZIP_MAGIC) {
        return Ok(raw);
    }
    let mut s = Vec::<u8>::new();
    match GzDecoder::new(&raw[..]).read_to_end(&mut s) {
        Ok(_) => Ok(s),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(LoadError::Truncated {
            path: path.to_owned(),
        }),
        Err(e) => Err(io_error(e)),
    }
}

fn parse(path: &Path, text: &str) -> Result<LocaleLog, LoadError> {
    let decode = |line, message: String| LoadError::Decode {
        path: path.to_owned(),
        line,
        message,
    };
    let mut lines = text.lines().enumerate().map(|(i, line)| (i + 1, line));
    let header = match lines.next() {
        Some((_, line)) => parse_header(line)
            .map(|(_, header)| header)
            .map_err(|e| decode(1, format!("invalid header: {}", e)))?,
        None => return Err(decode(1, "missing header".to_owned())),
    };

    let mut records = Vec::new();
    for (line_no, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = from_str(line).map_err(|e| decode(line_no, e.to_string()))?;
        records.push((line_no, record));
    }
    Ok(LocaleLog {
        path: path.to_owned(),
        header,
        records,
    })
}

/// Reads and decodes one trace file, decompressing it first if it is gzip.
pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<LocaleLog, LoadError> {
    let path = path.as_ref();
    let contents = read_contents(path)?;
    let text = String::from_utf8(contents).map_err(|e| {
        let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
        LoadError::Decode {
            path: path.to_owned(),
            line: valid.iter().filter(|&&b| b == b'\n').count() + 1,
            message: "invalid UTF-8".to_owned(),
        }
    })?;
    // Every record is newline terminated, so anything else was cut short.
    if !text.ends_with('\n') {
        return Err(LoadError::Truncated {
            path: path.to_owned(),
        });
    }
    parse(path, &text)
}
