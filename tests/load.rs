use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use chplvis::error::{AggregationWarning, LoadError};
use chplvis::loader::{Config, load_data, load_data_with};
use chplvis::state::{FuncID, LocaleID, State, TagID, TagRef, TaskID, Timestamp};
use chplvis::timeline::TimelineKind;

fn write_trace(dir: &Path, stem: &str, nid: u32, nodes: u32, body: &str) -> PathBuf {
    let path = dir.join(format!("{}-{}", stem, nid));
    let mut text = format!(
        "ChplVdebug: ver 1.4 nodes {} nid {} tid 1 seq 0 100.0 0.5 0.1\n",
        nodes, nid
    );
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        text.push_str(line);
        text.push('\n');
    }
    fs::write(&path, text).unwrap();
    path
}

fn phase1_body() -> String {
    let mut body = String::from("fname: 1 0 phase.chpl\nTag: 100.1 0.6 0.1 0 Phase1\n");
    for task in 1..=3 {
        let t = 100.0 + 0.1 * (task as f64 + 1.0);
        body.push_str(&format!("Btask: {:.2} {}\n", t, task));
        body.push_str(&format!("get: {:.3} {} 0 100 10 1\n", t + 0.01, task));
        body.push_str(&format!("get: {:.3} {} 0 100 11 1\n", t + 0.02, task));
        body.push_str(&format!("Etask: {:.3} {}\n", t + 0.05, task));
    }
    body.push_str("Pause: 101.0 0.9 0.2 0\nEnd: 101.5 1.0 0.2\n");
    body
}

fn two_locale_run(dir: &Path) -> PathBuf {
    write_trace(
        dir,
        "E",
        0,
        2,
        "Tag: 100.1 0.5 0.1 0 A
         Btask: 100.2 1
         put: 100.25 1 1 32 7 0
         Etask: 100.3 1
         Pause: 100.4 0.6 0.1 0
         Tag: 100.5 0.6 0.1 1 B
         Btask: 100.6 2
         Btask: 100.61 3
         Etask: 100.7 2
         Etask: 100.71 3
         Pause: 100.8 0.7 0.1 1
         End: 100.9 0.7 0.1",
    );
    write_trace(
        dir,
        "E",
        1,
        2,
        "Tag: 100.1 0.5 0.1 0 A
         Btask: 100.15 4
         get: 100.2 4 0 64 9 0
         Etask: 100.3 4
         Pause: 100.4 0.6 0.1 0
         Tag: 100.5 0.6 0.1 1 B
         Btask: 100.55 5
         Etask: 100.75 5
         Pause: 100.8 0.6 0.2 1
         End: 100.9 0.6 0.2",
    );
    dir.join("E")
}

#[test]
fn test_phase1_matrix_from_files() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), "P", 0, 1, &phase1_body());
    let state = load_data(dir.path().join("P"), false).unwrap();

    assert_eq!(state.num_locales(), 1);
    assert_eq!(state.tag_count(), 1);
    assert!(state.has_unique_tags());
    assert!(state.warnings().is_empty());
    let phase = state.get_tag_data(TagRef::Tag(TagID(0))).unwrap();
    assert_eq!(phase.name, "Phase1");
    let cell = phase.comm(LocaleID(0), LocaleID(0)).unwrap();
    assert_eq!(cell.num_comms, 6);
    assert_eq!(cell.comm_size, 600);
    assert_eq!(phase.locales[0].num_tasks, 3);
    assert_eq!(phase.locales[0].clock_time, Timestamp(900_000_000));
    assert_eq!(phase.locales[0].user_cpu, Timestamp(300_000_000));
    assert_eq!(phase.locales[0].sys_cpu, Timestamp(100_000_000));

    let all = state.get_tag_data(TagRef::All).unwrap();
    assert_eq!(all.locales[0].clock_time, Timestamp(1_500_000_000));
    assert_eq!(all.locales[0].cpu, Timestamp(600_000_000));
    assert_eq!(state.start_clock(), Some(Timestamp::from_secs(100)));
    assert_eq!(state.file_name(chplvis::state::FileID(1)), Some("phase.chpl"));
    assert_eq!(
        state.file_is_relative_to_home(chplvis::state::FileID(1)),
        Some(false)
    );
}

#[test]
fn test_task_counts_sum_over_tags() {
    let dir = tempfile::tempdir().unwrap();
    let state = load_data(two_locale_run(dir.path()), false).unwrap();
    assert_eq!(state.num_locales(), 2);
    let all = state.get_tag_data(TagRef::All).unwrap();
    for locale in 0..2 {
        let sum: u64 = (0..state.tag_count() as u32)
            .map(|t| {
                state.get_tag_data(TagRef::Tag(TagID(t))).unwrap().locales[locale].num_tasks
            })
            .sum();
        assert_eq!(all.locales[locale].num_tasks, sum);
    }
    assert_eq!(all.locales[0].num_tasks, 3);
    assert_eq!(all.locales[1].num_tasks, 2);

    let b = state.get_tag_data(TagRef::Tag(TagID(1))).unwrap();
    assert_eq!(b.locales[0].max_conc, 2);
    assert_eq!(b.max_conc, 2);
    assert_eq!(b.max_tasks, 2);
}

#[test]
fn test_matrix_orientation() {
    let dir = tempfile::tempdir().unwrap();
    let state = load_data(two_locale_run(dir.path()), false).unwrap();
    let a = state.get_tag_data(TagRef::Tag(TagID(0))).unwrap();
    // Locale 0 puts to 1 and locale 1 gets from 0: both move data 0 -> 1.
    let cell = a.comm(LocaleID(0), LocaleID(1)).unwrap();
    assert_eq!(cell.num_comms, 2);
    assert_eq!(cell.num_puts, 1);
    assert_eq!(cell.num_gets, 1);
    assert_eq!(cell.comm_size, 96);
    assert!(a.comm(LocaleID(1), LocaleID(0)).unwrap().is_empty());

    let task = state
        .get_task_data(LocaleID(1), TaskID(4), TagRef::Tag(TagID(0)))
        .unwrap();
    assert_eq!(task.comms.len(), 1);
    assert_eq!(task.comms[0].src, LocaleID(0));
    assert_eq!(task.comms[0].dst, LocaleID(1));
}

#[test]
fn test_timeline_is_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let state = load_data(two_locale_run(dir.path()), false).unwrap();
    for locale in 0..2 {
        let entries: Vec<_> = state.timeline(LocaleID(locale)).collect();
        assert!(entries.windows(2).all(|w| w[0].time <= w[1].time));
        for (index, entry) in entries.iter().enumerate() {
            if let TimelineKind::TaskEnd(task) = entry.kind {
                assert!(
                    entries[..index]
                        .iter()
                        .any(|e| e.kind == TimelineKind::TaskBegin(task))
                );
            }
        }
    }
    let first: Vec<_> = state.timeline(LocaleID(0)).map(|e| e.kind).collect();
    assert_eq!(first[0], TimelineKind::TagEnter(TagID(0)));
    assert_eq!(first.len(), 2 + 2 + 4);
}

fn summary(state: &State) -> String {
    let mut out = String::new();
    for tag in [TagRef::All, TagRef::Start]
        .into_iter()
        .chain((0..state.tag_count() as u32).map(|t| TagRef::Tag(TagID(t))))
    {
        out.push_str(&format!("{:?}\n", state.get_tag_data(tag)));
    }
    out
}

#[test]
fn test_loading_twice_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let base = two_locale_run(dir.path());
    let first = load_data(&base, false).unwrap();
    let second = load_data_with(
        &base,
        &Config {
            discover: true,
            parallel: false,
            verbose: false,
        },
    )
    .unwrap();
    assert_eq!(first.events(), second.events());
    assert_eq!(summary(&first), summary(&second));
}

#[test]
fn test_unterminated_tag() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        "U",
        0,
        1,
        "Tag: 100.5 0.5 0.1 0 open
         Btask: 100.6 1
         nb_put: 100.7 1 0 48 3 0
         Etask: 101.0 1",
    );
    let state = load_data(dir.path().join("U"), false).unwrap();
    let open = state.get_tag_data(TagRef::Tag(TagID(0))).unwrap();
    assert_eq!(open.locales[0].clock_time, Timestamp(500_000_000));
    assert_eq!(open.max_clock, Timestamp(500_000_000));
    assert_eq!(open.max_tasks, 1);
    assert_eq!(open.max_comms, 1);
    assert_eq!(open.max_size, 48);
    let all = state.get_tag_data(TagRef::All).unwrap();
    assert_eq!(all.locales[0].clock_time, Timestamp::from_secs(1));
}

#[test]
fn test_repeated_names_alias() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        "L",
        0,
        1,
        "Tag: 100.1 0.5 0.1 0 Loop
         Btask: 100.2 1
         Etask: 100.3 1
         Pause: 100.4 0.5 0.1 0
         Tag: 100.5 0.5 0.1 1 Loop
         Btask: 100.6 2
         Btask: 100.61 3
         Etask: 100.7 2
         Etask: 100.71 3
         Pause: 100.8 0.5 0.1 1",
    );
    let state = load_data(dir.path().join("L"), false).unwrap();
    assert_eq!(state.tag_count(), 2);
    assert_eq!(state.logical_tag_count(), 1);
    assert!(!state.has_unique_tags());
    let logical = state.get_logical_tag_data(TagRef::Tag(TagID(0))).unwrap();
    assert_eq!(logical.locales[0].num_tasks, 3);
    assert_eq!(
        state.get_tag_data(TagRef::Tag(TagID(0))).unwrap().locales[0].num_tasks,
        1
    );
    assert_eq!(
        state.get_tag_data(TagRef::Tag(TagID(1))).unwrap().locales[0].num_tasks,
        2
    );
    assert!(state.get_logical_tag_data(TagRef::Tag(TagID(1))).is_none());
    assert_eq!(
        state.get_logical_tag_data(TagRef::All).unwrap().locales[0].num_tasks,
        3
    );
}

#[test]
fn test_out_of_range_comm() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        "R",
        0,
        1,
        "Btask: 100.1 1
         get: 100.2 1 1 8 4 0
         Etask: 100.3 1",
    );
    let state = load_data(dir.path().join("R"), false).unwrap();
    assert_eq!(state.warnings().len(), 1);
    assert!(matches!(
        state.warnings()[0],
        AggregationWarning::LocaleOutOfRange {
            remote: LocaleID(1),
            num_locales: 1,
            ..
        }
    ));
    let all = state.get_tag_data(TagRef::All).unwrap();
    assert!(all.total_comms().is_empty());
}

#[test]
fn test_gzip_trace() {
    let dir = tempfile::tempdir().unwrap();
    let plain = write_trace(dir.path(), "Z", 0, 1, &phase1_body());
    let text = fs::read(&plain).unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&text).unwrap();
    fs::write(&plain, encoder.finish().unwrap()).unwrap();

    let state = load_data(dir.path().join("Z"), false).unwrap();
    let phase = state.get_tag_data(TagRef::Tag(TagID(0))).unwrap();
    assert_eq!(phase.comm(LocaleID(0), LocaleID(0)).unwrap().comm_size, 600);
}

#[test]
fn test_missing_locale() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), "M", 0, 3, "");
    write_trace(dir.path(), "M", 1, 3, "");
    match load_data(dir.path().join("M"), false) {
        Err(LoadError::MissingLocale { locale, .. }) => assert_eq!(locale, LocaleID(2)),
        other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
    }

    // M-2 still says it is locale 1.
    fs::rename(dir.path().join("M-1"), dir.path().join("M-2")).unwrap();
    match load_data(dir.path().join("M"), true) {
        Err(LoadError::LocaleMismatch { expected, found, .. }) => {
            assert_eq!(expected, LocaleID(2));
            assert_eq!(found, LocaleID(1));
        }
        other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
    }
    // Discovery finds 0 and 2, so 1 is the gap.
    write_trace(dir.path(), "M", 2, 3, "");
    match load_data(dir.path().join("M"), true) {
        Err(LoadError::MissingLocale { locale, .. }) => assert_eq!(locale, LocaleID(1)),
        other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
    }
}

#[test]
fn test_discovery() {
    let dir = tempfile::tempdir().unwrap();
    for nid in 0..3 {
        write_trace(dir.path(), "D", nid, 3, "Btask: 100.1 1\nEtask: 100.2 1");
    }
    fs::write(dir.path().join("D-notes"), "not a trace").unwrap();
    fs::write(dir.path().join("Other-0"), "not a trace").unwrap();
    let state = load_data(dir.path().join("D"), true).unwrap();
    assert_eq!(state.num_locales(), 3);
    assert_eq!(
        state
            .get_task_data(LocaleID(2), TaskID(1), TagRef::All)
            .and_then(|t| t.end),
        Some(Timestamp(100_200_000_000))
    );

    assert!(matches!(
        load_data(dir.path().join("Nothing"), true),
        Err(LoadError::NoTraceFiles { .. })
    ));
}

#[test]
fn test_bad_files_reject_the_load() {
    let dir = tempfile::tempdir().unwrap();

    write_trace(dir.path(), "T", 0, 2, "Btask: 100.1 1");
    let truncated = dir.path().join("T-1");
    fs::write(
        &truncated,
        "ChplVdebug: ver 1.4 nodes 2 nid 1 tid 1 seq 0 100.0 0 0\nBtask: 100.1 1",
    )
    .unwrap();
    assert!(matches!(
        load_data(dir.path().join("T"), false),
        Err(LoadError::Truncated { .. })
    ));

    write_trace(dir.path(), "N", 0, 1, "Btask: 100.3 1\nEtask: 100.2 1");
    match load_data(dir.path().join("N"), false) {
        Err(LoadError::NonMonotonic { line, .. }) => assert_eq!(line, 3),
        other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
    }

    write_trace(dir.path(), "C", 0, 2, "");
    write_trace(dir.path(), "C", 1, 3, "");
    assert!(matches!(
        load_data(dir.path().join("C"), false),
        Err(LoadError::NodeCountMismatch {
            expected: 2,
            found: 3,
            ..
        })
    ));

    write_trace(dir.path(), "X", 0, 1, "Btask: 100.1");
    assert!(matches!(
        load_data(dir.path().join("X"), false),
        Err(LoadError::Decode { line: 2, .. })
    ));
}

fn write_raw(dir: &Path, name: &str, text: &str) {
    fs::write(dir.join(name), text).unwrap();
}

#[test]
fn test_huge_node_count_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(
        dir.path(),
        "H-0",
        "ChplVdebug: ver 1.4 nodes 4294967295 nid 0 tid 1 seq 0 100.0 0 0\n",
    );
    for discover in [false, true] {
        match load_data(dir.path().join("H"), discover) {
            Err(LoadError::MissingLocale { locale, .. }) => assert_eq!(locale, LocaleID(1)),
            other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
        }
    }
}

#[test]
fn test_run_sequence() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(
        dir.path(),
        "S-0",
        "ChplVdebug: ver 1.4 nodes 1 nid 0 tid 1 seq 1457367001.123 100.0 0 0\n",
    );
    assert_eq!(load_data(dir.path().join("S"), false).unwrap().num_locales(), 1);

    write_raw(
        dir.path(),
        "Q-0",
        "ChplVdebug: ver 1.4 nodes 2 nid 0 tid 1 seq 5 100.0 0 0\n",
    );
    write_raw(
        dir.path(),
        "Q-1",
        "ChplVdebug: ver 1.4 nodes 2 nid 1 tid 1 seq 9 900.0 0 0\n",
    );
    for discover in [false, true] {
        match load_data(dir.path().join("Q"), discover) {
            Err(LoadError::RunMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, Timestamp::from_secs(5));
                assert_eq!(found, Timestamp::from_secs(9));
            }
            other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
        }
    }
}

#[test]
fn test_locale_beyond_node_count() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(dir.path(), "E", 0, 2, "");
    write_trace(dir.path(), "E", 1, 2, "");
    write_trace(dir.path(), "E", 5, 2, "");
    match load_data(dir.path().join("E"), true) {
        Err(LoadError::LocaleOutOfRange { locale, nodes, .. }) => {
            assert_eq!(locale, LocaleID(5));
            assert_eq!(nodes, 2);
        }
        other => panic!("unexpected {:?}", other.map(|s| s.num_locales())),
    }
    // Count mode never looks past the node count.
    assert_eq!(load_data(dir.path().join("E"), false).unwrap().num_locales(), 2);
}

#[test]
fn test_main_task_and_functions_from_files() {
    let dir = tempfile::tempdir().unwrap();
    write_trace(
        dir.path(),
        "F",
        0,
        1,
        "fname: 1 0 work.chpl
         fid: 0 5 1 main
         fid: 1 20 1 work
         fork: 100.1 1 0 16 1
         get: 100.2 1 0 8 22 1
         put: 100.25 1 0 8 6 1
         End: 100.3 0.6 0.1",
    );
    let state = load_data(dir.path().join("F"), false).unwrap();
    assert!(state.warnings().is_empty());

    let main = state.main_task().unwrap();
    assert_eq!(main.task, TaskID(1));
    assert_eq!(main.record.comms.len(), 3);
    assert_eq!(main.record.task_clock, Timestamp(300_000_000));

    let work = state.function_stats(FuncID(1)).unwrap();
    assert_eq!((work.num_on_tasks, work.num_gets, work.num_puts), (1, 1, 0));
    let main_fn = state.function_stats(FuncID(0)).unwrap();
    assert_eq!(main_fn.num_puts, 1);
    assert_eq!(state.function(FuncID(1)).map(|f| f.name.as_str()), Some("work"));
}
