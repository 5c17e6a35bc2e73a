use std::fs::{create_dir, remove_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;

use crate::backend::common::{SiteName, slot_name, tag_views, task_name};
use crate::state::{CommSite, LocaleID, State, TagInstance, TagRef};

#[derive(Serialize)]
struct TagRecord<'a> {
    slot: String,
    name: &'a str,
    tag_no: Option<u32>,
    max_cpu_us: f64,
    max_clock_us: f64,
    max_tasks: u64,
    max_conc: u64,
    max_comms: u64,
    max_size: u64,
}

#[derive(Serialize)]
struct LocaleRecord<'a> {
    slot: &'a str,
    locale: u32,
    user_cpu_us: f64,
    sys_cpu_us: f64,
    cpu_us: f64,
    clock_us: f64,
    num_tasks: u64,
    max_conc: u64,
    max_task_clock_us: f64,
}

const COMM_HEADERS: [&str; 7] = [
    "src",
    "dst",
    "num_comms",
    "num_gets",
    "num_puts",
    "num_forks",
    "comm_size",
];

#[derive(Serialize)]
struct CommCellRecord {
    src: usize,
    dst: usize,
    num_comms: u64,
    num_gets: u64,
    num_puts: u64,
    num_forks: u64,
    comm_size: u64,
}

#[derive(Serialize)]
struct TaskRecord {
    locale: u32,
    task: u64,
    name: String,
    begin_us: Option<f64>,
    end_us: Option<f64>,
    end_tag: Option<String>,
    task_clock_us: f64,
    num_comms: u64,
    comm_size: u64,
    first_comm_site: Option<String>,
}

fn emit_comm_tsv<P: AsRef<Path>>(path: P, tag: TagRef, instance: &TagInstance) -> io::Result<()> {
    let mut filename = PathBuf::new();
    filename.push("comm");
    filename.push(format!("{}.tsv", slot_name(tag)));
    // Headers go out explicitly so an empty matrix still gets them.
    let mut f = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path.as_ref().join(&filename))?;
    f.write_record(COMM_HEADERS)?;

    for src in 0..instance.num_locales() {
        let Some(row) = instance.comm_row(LocaleID(src as u32)) else {
            continue;
        };
        for (dst, cell) in row.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            f.serialize(CommCellRecord {
                src,
                dst,
                num_comms: cell.num_comms,
                num_gets: cell.num_gets,
                num_puts: cell.num_puts,
                num_forks: cell.num_forks,
                comm_size: cell.comm_size,
            })?;
        }
    }
    f.flush()?;
    Ok(())
}

fn emit_tasks_tsv<P: AsRef<Path>>(path: P, state: &State) -> io::Result<()> {
    let mut f = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path.as_ref().join("tasks.tsv"))?;
    let origin = state.start_clock().unwrap_or_default();
    let Some(all) = state.get_tag_data(TagRef::All) else {
        return Ok(());
    };
    for (index, stats) in all.locales.iter().enumerate() {
        let locale = LocaleID(index as u32);
        for (task, record) in &stats.tasks {
            f.serialize(TaskRecord {
                locale: locale.0,
                task: task.0,
                name: task_name(state, locale, *task, record),
                begin_us: record.begin.map(|t| t.saturating_sub(origin).to_us()),
                end_us: record.end.map(|t| t.saturating_sub(origin).to_us()),
                end_tag: record.end_tag.map(slot_name),
                task_clock_us: record.task_clock.to_us(),
                num_comms: record.comm_sum.num_comms,
                comm_size: record.comm_sum.comm_size,
                first_comm_site: record
                    .comms
                    .first()
                    .map(|c| SiteName::new(state, c.site).to_string()),
            })?;
        }
    }
    f.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct FunctionRecord {
    func: u32,
    name: String,
    num_on_tasks: u64,
    num_tasks: u64,
    num_gets: u64,
    num_puts: u64,
}

fn emit_functions_tsv<P: AsRef<Path>>(path: P, state: &State) -> io::Result<()> {
    let mut f = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path.as_ref().join("functions.tsv"))?;
    for (func, stats) in state.function_stats_iter() {
        f.serialize(FunctionRecord {
            func: func.0,
            name: SiteName::new(state, CommSite::Func(func)).to_string(),
            num_on_tasks: stats.num_on_tasks,
            num_tasks: stats.num_tasks,
            num_gets: stats.num_gets,
            num_puts: stats.num_puts,
        })?;
    }
    f.flush()?;
    Ok(())
}

fn create_unique_dir<P: AsRef<Path>>(path: P, force: bool) -> io::Result<PathBuf> {
    let mut path = path.as_ref().to_owned();
    if force {
        println!("Removing previous contents of {:?}", &path);
        let _ = remove_dir_all(&path); // ignore failure, we'll catch it on create
        create_dir(&path)?;
    } else if create_dir(&path).is_err() {
        let mut i = 1;
        let retry_limit = 100;
        let base = path.file_name().unwrap_or_default().to_owned();
        loop {
            let mut f = base.clone();
            f.push(format!(".{}", i));
            let p = path.with_file_name(f);
            let r = create_dir(&p);
            if r.is_ok() {
                path = p;
                break;
            } else if i >= retry_limit {
                // tried too many times, assume this is a permanent failure
                r?;
            }
            i += 1;
        }
    }
    Ok(path)
}

/// Writes the tag, locale, task and communication tables as TSV files
/// under a fresh directory, returning the directory used.
pub fn emit_tsv_export<P: AsRef<Path>>(
    state: &State,
    path: P,
    force: bool,
    logical: bool,
) -> io::Result<PathBuf> {
    let path = create_unique_dir(path, force)?;
    println!("Generating TSV files in directory {:?}", &path);
    create_dir(path.join("comm"))?;

    let views = tag_views(state, logical);
    views
        .par_iter()
        .map(|(tag, instance)| emit_comm_tsv(&path, *tag, instance))
        .collect::<io::Result<()>>()?;

    {
        let mut file = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path.join("tags.tsv"))?;
        for (tag, instance) in &views {
            file.serialize(TagRecord {
                slot: slot_name(*tag),
                name: &instance.name,
                tag_no: instance.tag_no,
                max_cpu_us: instance.max_cpu.to_us(),
                max_clock_us: instance.max_clock.to_us(),
                max_tasks: instance.max_tasks,
                max_conc: instance.max_conc,
                max_comms: instance.max_comms,
                max_size: instance.max_size,
            })?;
        }
        file.flush()?;
    }

    {
        let mut file = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path.join("locales.tsv"))?;
        for (tag, instance) in &views {
            let slot = slot_name(*tag);
            for (index, stats) in instance.locales.iter().enumerate() {
                file.serialize(LocaleRecord {
                    slot: &slot,
                    locale: index as u32,
                    user_cpu_us: stats.user_cpu.to_us(),
                    sys_cpu_us: stats.sys_cpu.to_us(),
                    cpu_us: stats.cpu.to_us(),
                    clock_us: stats.clock_time.to_us(),
                    num_tasks: stats.num_tasks,
                    max_conc: stats.max_conc,
                    max_task_clock_us: stats.max_task_clock.to_us(),
                })?;
            }
        }
        file.flush()?;
    }

    emit_tasks_tsv(&path, state)?;
    emit_functions_tsv(&path, state)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::{build, ev, get, start, tag};
    use crate::state::{EventKind, TaskID};

    #[test]
    fn test_tsv_export() {
        let state = build(
            2,
            vec![
                ev(0, 0, start()),
                ev(0, 1, start()),
                ev(1, 0, tag(0, "io", 1)),
                ev(2, 0, EventKind::BeginTask { task: TaskID(1) }),
                ev(3, 0, get(1, 1, 0, 256, 3)),
                ev(4, 0, EventKind::EndTask { task: TaskID(1) }),
            ],
        );
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let first = emit_tsv_export(&state, &out, false, false).unwrap();
        assert_eq!(first, out);
        let second = emit_tsv_export(&state, &out, false, false).unwrap();
        assert_eq!(second, dir.path().join("out.1"));

        let tags = std::fs::read_to_string(out.join("tags.tsv")).unwrap();
        let lines: Vec<_> = tags.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("slot\tname\ttag_no"));
        assert!(lines[3].starts_with("tag0\tio\t0\t"));

        let comm = std::fs::read_to_string(out.join("comm").join("tag0.tsv")).unwrap();
        assert_eq!(comm.lines().nth(1), Some("1\t0\t1\t1\t0\t0\t256"));
        let start = std::fs::read_to_string(out.join("comm").join("start.tsv")).unwrap();
        assert_eq!(
            start,
            "src\tdst\tnum_comms\tnum_gets\tnum_puts\tnum_forks\tcomm_size\n"
        );
        let locales = std::fs::read_to_string(out.join("locales.tsv")).unwrap();
        assert_eq!(locales.lines().count(), 1 + 3 * 2);
        let tasks = std::fs::read_to_string(out.join("tasks.tsv")).unwrap();
        assert_eq!(tasks.lines().count(), 2);
    }

    #[test]
    fn test_logical_tsv_export() {
        let state = build(
            1,
            vec![
                ev(0, 0, start()),
                ev(1, 0, tag(0, "Loop", 1)),
                ev(2, 0, EventKind::BeginTask { task: TaskID(1) }),
                ev(3, 0, EventKind::EndTask { task: TaskID(1) }),
                ev(4, 0, tag(1, "Loop", 4)),
                ev(5, 0, EventKind::BeginTask { task: TaskID(2) }),
                ev(6, 0, EventKind::EndTask { task: TaskID(2) }),
                ev(7, 0, tag(2, "Tail", 7)),
            ],
        );
        let dir = tempfile::tempdir().unwrap();

        let physical = emit_tsv_export(&state, dir.path().join("p"), false, false).unwrap();
        let tags = std::fs::read_to_string(physical.join("tags.tsv")).unwrap();
        assert_eq!(tags.lines().count(), 1 + 2 + 3);

        let logical = emit_tsv_export(&state, dir.path().join("l"), false, true).unwrap();
        let tags = std::fs::read_to_string(logical.join("tags.tsv")).unwrap();
        let lines: Vec<_> = tags.lines().collect();
        assert_eq!(lines.len(), 1 + 2 + 2);
        // Logical tags have no runtime tag number.
        assert!(lines[3].starts_with("tag0\tLoop\t\t"));
        assert!(lines[4].starts_with("tag1\tTail\t\t"));
        assert!(!logical.join("comm").join("tag2.tsv").exists());

        let locales = std::fs::read_to_string(logical.join("locales.tsv")).unwrap();
        let loop_row = locales
            .lines()
            .find(|l| l.starts_with("tag0\t"))
            .unwrap();
        let columns: Vec<_> = loop_row.split('\t').collect();
        assert_eq!(columns[6], "2");
    }
}
