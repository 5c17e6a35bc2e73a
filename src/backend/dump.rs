use std::io;
use std::io::Write;

use crate::state::Event;

/// One JSON object per merged event, one event per line.
pub fn dump_events<W: Write>(events: &[Event], mut out: W) -> io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        writeln!(out)?;
    }
    Ok(())
}
