//! Delete completed modifications.

use anyhow::Result;

use mt_db::Database;

use super::util::parse_instant;

/// Deletes `done` modifications created before the given instant.
pub fn run(db: &mut Database, before: &str) -> Result<()> {
    let before = parse_instant(before)?;
    let purged = db.purge_done_modifications(before)?;
    println!("Purged {purged} modification(s).");
    Ok(())
}
