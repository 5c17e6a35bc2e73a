use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::backend::common::{SiteName, tag_views};
use crate::state::{CommSite, LocaleID, State, TagInstance, TagRef, Timestamp};

fn format_us(time: Timestamp) -> String {
    let threshold = 1000000.0;
    let us = time.to_us();
    if us < threshold {
        format!("{:.3} us", us)
    } else {
        format!("{:.3e} us", us)
    }
}

fn print_tag(tag: TagRef, instance: &TagInstance) {
    println!("");
    println!("      {} ({})", instance.name, tag);
    println!(
        "          Max clock time: {}, max CPU time: {}",
        format_us(instance.max_clock),
        format_us(instance.max_cpu)
    );
    for (index, stats) in instance.locales.iter().enumerate() {
        let locale = LocaleID(index as u32);
        println!("          Locale {}", locale);
        println!("              Clock time: {}", format_us(stats.clock_time));
        let cpu = stats.cpu.to_us();
        let percent = if stats.clock_time.0 > 0 {
            100.0 * cpu / stats.clock_time.to_us()
        } else {
            0.0
        };
        println!(
            "              CPU time: {} ({:.2}%), user {}, sys {}",
            format_us(stats.cpu),
            percent,
            format_us(stats.user_cpu),
            format_us(stats.sys_cpu)
        );
        println!(
            "              Tasks: {} (max concurrency {}, longest {})",
            stats.num_tasks,
            stats.max_conc,
            format_us(stats.max_task_clock)
        );
        if let Some(row) = instance.comm_row(locale) {
            for (dst, cell) in row.iter().enumerate() {
                if cell.is_empty() {
                    continue;
                }
                println!(
                    "              To locale {}: {} comms ({} gets, {} puts, {} forks), {} bytes",
                    dst,
                    cell.num_comms,
                    cell.num_gets,
                    cell.num_puts,
                    cell.num_forks,
                    cell.comm_size
                );
            }
        }
    }
}

pub fn print_statistics(state: &State, logical: bool) {
    let views = tag_views(state, logical);

    // Reserved tags first, then the rest by the longest time any locale
    // spent in them.
    let mut ordering = BTreeMap::<Reverse<Timestamp>, Vec<(TagRef, &TagInstance)>>::new();
    for (tag, instance) in &views[2..] {
        ordering
            .entry(Reverse(instance.max_clock))
            .or_insert(Vec::new())
            .push((*tag, *instance));
    }

    println!("");
    println!("  -------------------------");
    println!(
        "  Run of {} locales, {} tags ({} distinct names)",
        state.num_locales(),
        state.tag_count(),
        state.logical_tag_count()
    );
    println!("  -------------------------");
    for (tag, instance) in &views[..2] {
        print_tag(*tag, instance);
    }
    for (_, entries) in ordering {
        for (tag, instance) in entries {
            print_tag(tag, instance);
        }
    }

    if let Some(main) = state.main_task() {
        println!("");
        println!(
            "  Main task {} on locale {}: {}, {} comms, {} bytes",
            main.task,
            main.locale,
            format_us(main.record.task_clock),
            main.record.comm_sum.num_comms,
            main.record.comm_sum.comm_size
        );
    }

    let mut functions = state.function_stats_iter().peekable();
    if functions.peek().is_some() {
        println!("");
        println!("  Functions:");
    }
    for (func, stats) in functions {
        println!(
            "      {}: {} on tasks, {} tasks, {} gets, {} puts",
            SiteName::new(state, CommSite::Func(func)),
            stats.num_on_tasks,
            stats.num_tasks,
            stats.num_gets,
            stats.num_puts
        );
    }

    let warnings = state.warnings();
    if !warnings.is_empty() {
        println!("");
        println!("  {} events were skipped:", warnings.len());
        for warning in warnings {
            println!("      {}", warning);
        }
    }
}
