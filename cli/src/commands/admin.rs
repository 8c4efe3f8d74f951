use anyhow::{Result, bail};
use serde::Serialize;
use std::path::Path;
use tabled::{Table, Tabled, settings::Style};

use mealplan_core::backup::BackupInfo;
use mealplan_core::db::Database;
use mealplan_core::migrations::{self, Migration, MigrationStatus};
use mealplan_core::models::TableCounts;
use mealplan_core::seed::{SeedData, SeedSummary, seed};

use super::backup::safety_backup;
use super::helpers::print_json;

fn load_migrations(dir: Option<&Path>) -> Result<Vec<Migration>> {
    match dir {
        Some(d) => migrations::discover(d),
        None => Ok(migrations::embedded()),
    }
}

fn load_seed(dir: Option<&Path>) -> Result<SeedData> {
    match dir {
        Some(d) => SeedData::from_dir(d),
        None => SeedData::embedded(),
    }
}

fn current_version(status: &[MigrationStatus]) -> i64 {
    status
        .iter()
        .filter(|s| s.applied)
        .map(|s| s.version)
        .max()
        .unwrap_or(0)
}

fn print_seed_summary(summary: &SeedSummary) {
    println!(
        "Seeded {} meals and {} side dishes ({} already present)",
        summary.meals_inserted,
        summary.side_dishes_inserted,
        summary.meals_skipped + summary.side_dishes_skipped
    );
}

#[derive(Serialize)]
struct InstallOutput {
    backup: Option<BackupInfo>,
    migrations_applied: Vec<i64>,
    removed: TableCounts,
    seeded: SeedSummary,
}

/// Bring the schema up to date, back up and clear existing data, then load
/// the seed catalogue.
pub(crate) fn cmd_install(
    db_path: &Path,
    backup_dir: &Path,
    migrations_dir: Option<&Path>,
    seed_dir: Option<&Path>,
    no_backup: bool,
    json: bool,
) -> Result<()> {
    let migrations = load_migrations(migrations_dir)?;
    let data = load_seed(seed_dir)?;

    let db = Database::open_unmigrated(db_path)?;
    let migrations_applied = db.apply_migrations(&migrations)?;
    let backup = safety_backup(&db, backup_dir, no_backup, json)?;
    let removed = db.truncate_all()?;
    let seeded = seed(&db, &data)?;

    if json {
        return print_json(&InstallOutput {
            backup,
            migrations_applied,
            removed,
            seeded,
        });
    }
    if !migrations_applied.is_empty() {
        println!("Applied {} migration(s)", migrations_applied.len());
    }
    if removed != TableCounts::default() {
        println!(
            "Cleared {} meals, {} side dishes, {} history entries",
            removed.meals, removed.side_dishes, removed.meal_history
        );
    }
    print_seed_summary(&seeded);
    println!("Database ready at {}", db_path.display());
    Ok(())
}

pub(crate) fn cmd_migrate(
    db_path: &Path,
    dir: Option<&Path>,
    to: Option<i64>,
    status: bool,
    json: bool,
) -> Result<()> {
    let migrations = load_migrations(dir)?;
    let db = Database::open_unmigrated(db_path)?;

    if status {
        return print_status(&db.migration_status(&migrations)?, json);
    }

    let current = current_version(&db.migration_status(&migrations)?);
    let (direction, versions) = match to {
        Some(target) if target < current => (
            "reverted",
            db.rollback_migrations(&migrations, target)?,
        ),
        Some(target) => {
            if !migrations.iter().any(|m| m.version == target) && target != 0 {
                bail!("No migration with version {target}");
            }
            let wanted: Vec<Migration> = migrations
                .into_iter()
                .filter(|m| m.version <= target)
                .collect();
            ("applied", db.apply_migrations(&wanted)?)
        }
        None => ("applied", db.apply_migrations(&migrations)?),
    };

    if json {
        println!("{}", serde_json::json!({ direction: versions }));
    } else if versions.is_empty() {
        println!("Schema is up to date (version {current})");
    } else {
        let list: Vec<String> = versions.iter().map(ToString::to_string).collect();
        println!("Migrations {direction}: {}", list.join(", "));
    }
    Ok(())
}

fn print_status(status: &[MigrationStatus], json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Version")]
        version: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        state: &'static str,
        #[tabled(rename = "Applied at")]
        applied_at: String,
        #[tabled(rename = "Down")]
        reversible: &'static str,
    }

    if json {
        return print_json(status);
    }
    let rows: Vec<StatusRow> = status
        .iter()
        .map(|s| StatusRow {
            version: s.version,
            name: s.name.clone(),
            state: if s.applied { "applied" } else { "pending" },
            applied_at: s.applied_at.clone().unwrap_or_else(|| "-".into()),
            reversible: if s.reversible { "yes" } else { "no" },
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_seed(db: &Database, dir: Option<&Path>, json: bool) -> Result<()> {
    let data = load_seed(dir)?;
    let summary = seed(db, &data)?;
    if json {
        print_json(&summary)
    } else {
        print_seed_summary(&summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mealplan_core::models::{NewHistoryEntry, NewMeal, MealType};
    use tempfile::TempDir;

    #[test]
    fn test_current_version() {
        let db = Database::open_in_memory().unwrap();
        let status = db.migration_status(&migrations::embedded()).unwrap();
        assert_eq!(current_version(&status), 3);
        assert_eq!(current_version(&[]), 0);
    }

    #[test]
    fn test_install_replaces_data_with_seed() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("mealplan.db");
        let backup_dir = dir.path().join("backups");
        {
            let db = Database::open(&db_path).unwrap();
            db.insert_meal(&NewMeal {
                name: "Homemade Pizza".to_string(),
                meal_types: vec![MealType::Vegetable],
                notes: None,
                frequency_factor: 1.0,
                active_time: None,
                passive_time: None,
                has_side_dish: false,
            })
            .unwrap();
            db.add_history(&NewHistoryEntry {
                date_eaten: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                meal: "Homemade Pizza".to_string(),
                side_dish: None,
            })
            .unwrap();
        }

        cmd_install(&db_path, &backup_dir, None, None, false, true).unwrap();

        let db = Database::open(&db_path).unwrap();
        assert!(db.get_meal_by_name("Homemade Pizza").unwrap().is_none());
        assert!(db.list_history(None).unwrap().is_empty());
        let seed = SeedData::embedded().unwrap();
        assert_eq!(db.list_meals().unwrap().len(), seed.meals.len());
        assert_eq!(
            mealplan_core::backup::list_backups(&backup_dir).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_install_on_fresh_database_skips_backup() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("mealplan.db");
        let backup_dir = dir.path().join("backups");

        cmd_install(&db_path, &backup_dir, None, None, false, true).unwrap();

        assert!(
            mealplan_core::backup::list_backups(&backup_dir)
                .unwrap()
                .is_empty()
        );
        assert!(!Database::open(&db_path).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_migrate_down_and_up() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("mealplan.db");

        cmd_migrate(&db_path, None, Some(1), false, true).unwrap();
        let db = Database::open_unmigrated(&db_path).unwrap();
        let status = db.migration_status(&migrations::embedded()).unwrap();
        assert_eq!(current_version(&status), 1);
        drop(db);

        cmd_migrate(&db_path, None, Some(0), false, true).unwrap();
        cmd_migrate(&db_path, None, Some(0), false, true).unwrap();
        let db = Database::open_unmigrated(&db_path).unwrap();
        let status = db.migration_status(&migrations::embedded()).unwrap();
        assert_eq!(current_version(&status), 0);
        drop(db);

        cmd_migrate(&db_path, None, None, false, true).unwrap();
        let db = Database::open_unmigrated(&db_path).unwrap();
        let status = db.migration_status(&migrations::embedded()).unwrap();
        assert_eq!(current_version(&status), 3);

        assert!(cmd_migrate(&db_path, None, Some(42), false, true).is_err());
    }
}
