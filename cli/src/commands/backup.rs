use anyhow::{Result, bail};
use serde::Serialize;
use std::path::Path;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use mealplan_core::backup::{
    BackupInfo, BackupOptions, backup_and_truncate, create_backup, list_backups, restore_backup,
    verify_backup,
};
use mealplan_core::db::Database;
use mealplan_core::models::TableCounts;

use super::helpers::print_json;

fn describe_counts(counts: &TableCounts) -> String {
    format!(
        "{} meals, {} side dishes, {} history entries",
        counts.meals, counts.side_dishes, counts.meal_history
    )
}

fn print_backup_info(info: &BackupInfo) {
    println!("Backup written to {}", info.path.display());
    println!("  {}", describe_counts(&info.counts));
    println!("  {} bytes, sha256 {}", info.bytes, info.checksum);
}

/// Back up a non-empty database before a destructive operation.
pub(crate) fn safety_backup(
    db: &Database,
    dir: &Path,
    skip: bool,
    json: bool,
) -> Result<Option<BackupInfo>> {
    if skip || db.is_empty()? {
        return Ok(None);
    }
    let info = create_backup(db, dir, BackupOptions::default())?;
    if !json {
        print_backup_info(&info);
    }
    Ok(Some(info))
}

pub(crate) fn cmd_backup_create(
    db: &Database,
    dir: &Path,
    minimize: bool,
    no_gzip: bool,
    json: bool,
) -> Result<()> {
    let info = create_backup(
        db,
        dir,
        BackupOptions {
            minimize,
            gzip: !no_gzip,
        },
    )?;
    if json {
        print_json(&info)
    } else {
        print_backup_info(&info);
        Ok(())
    }
}

pub(crate) fn cmd_backup_list(dir: &Path, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct BackupRow {
        #[tabled(rename = "File")]
        name: String,
        #[tabled(rename = "Bytes")]
        bytes: u64,
        #[tabled(rename = "Checksum")]
        checksum: &'static str,
    }

    let backups = list_backups(dir)?;
    if json {
        return print_json(&backups);
    }
    if backups.is_empty() {
        println!("No backups in {}", dir.display());
        return Ok(());
    }

    let rows: Vec<BackupRow> = backups
        .into_iter()
        .map(|b| BackupRow {
            name: b.name,
            bytes: b.bytes,
            checksum: if b.has_checksum { "yes" } else { "missing" },
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(1)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

/// Accept a bare file name as relative to the backup directory.
fn resolve_backup_path(dir: &Path, file: &Path) -> Result<std::path::PathBuf> {
    if file.exists() {
        return Ok(file.to_path_buf());
    }
    let in_dir = dir.join(file);
    if in_dir.exists() {
        return Ok(in_dir);
    }
    bail!("Backup file not found: {}", file.display())
}

pub(crate) fn cmd_backup_verify(dir: &Path, file: &Path, json: bool) -> Result<()> {
    let path = resolve_backup_path(dir, file)?;
    let checksum = verify_backup(&path)?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path, "checksum": checksum, "valid": true })
        );
    } else {
        println!("{}: OK (sha256 {checksum})", path.display());
    }
    Ok(())
}

#[derive(Serialize)]
struct RestoreOutput {
    safety_backup: Option<BackupInfo>,
    restored: TableCounts,
}

pub(crate) fn cmd_backup_restore(
    db: &Database,
    dir: &Path,
    file: &Path,
    no_backup: bool,
    json: bool,
) -> Result<()> {
    let path = resolve_backup_path(dir, file)?;
    let safety = safety_backup(db, dir, no_backup, json)?;
    let restored = restore_backup(db, &path)?;
    if json {
        print_json(&RestoreOutput {
            safety_backup: safety,
            restored,
        })
    } else {
        println!(
            "Restored {} from {}",
            describe_counts(&restored),
            path.display()
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct TruncateOutput {
    backup: Option<BackupInfo>,
    removed: TableCounts,
}

pub(crate) fn cmd_backup_truncate(
    db: &Database,
    dir: &Path,
    no_backup: bool,
    json: bool,
) -> Result<()> {
    let (backup, removed) = if no_backup {
        (None, db.truncate_all()?)
    } else {
        let (info, removed) = backup_and_truncate(db, dir, BackupOptions::default())?;
        if !json {
            print_backup_info(&info);
        }
        (Some(info), removed)
    };

    if json {
        print_json(&TruncateOutput { backup, removed })
    } else {
        println!("Removed {}", describe_counts(&removed));
        Ok(())
    }
}
