//! Status command: machines and modification queue counts.

use std::io::Write;

use anyhow::Result;

use mt_db::Database;

/// Prints the registered machines and the modification queue breakdown.
pub fn run<W: Write>(writer: &mut W, db: &Database) -> Result<()> {
    let machines = db.list_machines()?;
    let counts = db.modification_counts()?;

    writeln!(writer, "Machine monitor status")?;

    if machines.is_empty() {
        writeln!(writer, "No machines registered.")?;
        return Ok(());
    }

    writeln!(writer, "Machines:")?;
    for machine in machines {
        writeln!(writer, "- {machine}")?;
    }

    if !counts.is_empty() {
        writeln!(writer, "Modifications:")?;
        for (status, count) in counts {
            writeln!(writer, "- {status}: {count}")?;
        }
    }

    Ok(())
}
