//! Versioned schema migrations.
//!
//! Migrations are SQL scripts named with a numeric prefix
//! (`001_create_meals.sql`), optionally paired with a rollback script
//! (`001_create_meals.down.sql`). Applied versions are recorded in the
//! `schema_migrations` table together with a checksum of the script, so a
//! run only executes what is pending and refuses to continue if an applied
//! script was edited afterwards.
//!
//! Each migration runs in its own transaction with its bookkeeping row; the
//! run stops at the first failure. Scripts must not contain their own
//! `BEGIN`/`COMMIT`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::digest::sha256_hex;

const EMBEDDED: &[(&str, &str, Option<&str>)] = &[
    (
        "001_create_meals.sql",
        include_str!("../migrations/001_create_meals.sql"),
        Some(include_str!("../migrations/001_create_meals.down.sql")),
    ),
    (
        "002_create_side_dishes.sql",
        include_str!("../migrations/002_create_side_dishes.sql"),
        Some(include_str!("../migrations/002_create_side_dishes.down.sql")),
    ),
    (
        "003_create_meal_history.sql",
        include_str!("../migrations/003_create_meal_history.sql"),
        Some(include_str!("../migrations/003_create_meal_history.down.sql")),
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
}

impl Migration {
    #[must_use]
    pub fn checksum(&self) -> String {
        sha256_hex(self.up.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
    pub reversible: bool,
}

/// Parse `NNN_name.sql` / `NNN_name.down.sql`. Returns `None` for files that
/// are not SQL or lack a numeric prefix.
#[must_use]
pub fn parse_file_name(file_name: &str) -> Option<MigrationFile> {
    let stem = file_name.strip_suffix(".sql")?;
    let (stem, direction) = match stem.strip_suffix(".down") {
        Some(s) => (s, Direction::Down),
        None => (stem, Direction::Up),
    };
    let (prefix, rest) = stem.split_once('_').unwrap_or((stem, ""));
    let version: i64 = prefix.parse().ok()?;
    let name = if rest.is_empty() { stem } else { rest };
    Some(MigrationFile {
        version,
        name: name.to_string(),
        direction,
    })
}

/// The migrations compiled into the binary.
#[must_use]
pub fn embedded() -> Vec<Migration> {
    EMBEDDED
        .iter()
        .filter_map(|(file, up, down)| {
            let parsed = parse_file_name(file)?;
            Some(Migration {
                version: parsed.version,
                name: parsed.name,
                up: (*up).to_string(),
                down: down.map(str::to_string),
            })
        })
        .collect()
}

/// Load migrations from a directory, ordered by version.
pub fn discover(dir: &Path) -> Result<Vec<Migration>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read migrations directory: {}", dir.display()))?;

    let mut ups: BTreeMap<i64, (String, String)> = BTreeMap::new();
    let mut downs: HashMap<i64, String> = HashMap::new();
    let mut found = 0usize;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "sql") {
            continue;
        }
        found += 1;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(parsed) = parse_file_name(&file_name) else {
            warn!(file = %path.display(), "Skipping SQL file without numeric prefix");
            continue;
        };
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read migration: {}", path.display()))?;
        debug!(file = %file_name, version = parsed.version, "Found migration file");

        let duplicate = match parsed.direction {
            Direction::Up => ups.insert(parsed.version, (parsed.name, sql)).is_some(),
            Direction::Down => downs.insert(parsed.version, sql).is_some(),
        };
        if duplicate {
            bail!(
                "Duplicate migration version {} in {}",
                parsed.version,
                dir.display()
            );
        }
    }

    debug!(found, "Scanned migrations directory");
    if ups.is_empty() {
        bail!("No valid SQL files found in {}", dir.display());
    }
    if let Some(orphan) = downs.keys().find(|v| !ups.contains_key(v)) {
        bail!("Rollback script for version {orphan} has no matching migration");
    }

    Ok(ups
        .into_iter()
        .map(|(version, (name, up))| Migration {
            version,
            name,
            up,
            down: downs.remove(&version),
        })
        .collect())
}

pub struct Migrator<'c> {
    conn: &'c Connection,
}

impl<'c> Migrator<'c> {
    pub fn new(conn: &'c Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )
        .context("Failed to create schema_migrations table")?;
        Ok(Self { conn })
    }

    pub fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let mut stmt = self.conn.prepare(
            "SELECT version, name, checksum, applied_at FROM schema_migrations ORDER BY version",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AppliedMigration {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    checksum: row.get(2)?,
                    applied_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn current_version(&self) -> Result<i64> {
        let version: Option<i64> =
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get(0)
                })?;
        Ok(version.unwrap_or(0))
    }

    pub fn status(&self, migrations: &[Migration]) -> Result<Vec<MigrationStatus>> {
        let applied: HashMap<i64, AppliedMigration> = self
            .applied()?
            .into_iter()
            .map(|a| (a.version, a))
            .collect();
        let mut out: Vec<MigrationStatus> = sorted(migrations)?
            .into_iter()
            .map(|m| {
                let record = applied.get(&m.version);
                MigrationStatus {
                    version: m.version,
                    name: m.name.clone(),
                    applied: record.is_some(),
                    applied_at: record.map(|a| a.applied_at.clone()),
                    reversible: m.down.is_some(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.version);
        Ok(out)
    }

    /// Apply every pending migration in version order. Returns the versions
    /// that were applied by this call.
    pub fn migrate(&self, migrations: &[Migration]) -> Result<Vec<i64>> {
        let ordered = sorted(migrations)?;
        let applied: HashMap<i64, AppliedMigration> = self
            .applied()?
            .into_iter()
            .map(|a| (a.version, a))
            .collect();

        for m in &ordered {
            if let Some(record) = applied.get(&m.version) {
                if record.checksum != m.checksum() {
                    bail!(
                        "Migration {} ({}) was modified after it was applied",
                        m.version,
                        m.name
                    );
                }
            }
        }

        let pending: Vec<&Migration> = ordered
            .iter()
            .filter(|m| !applied.contains_key(&m.version))
            .collect();
        self.apply(&pending)
    }

    /// Apply only the migrations newer than the current schema version.
    ///
    /// Applied rows are trusted as-is, so a database migrated from another
    /// script directory still opens with the built-in set.
    pub fn upgrade(&self, migrations: &[Migration]) -> Result<Vec<i64>> {
        let current = self.current_version()?;
        let ordered = sorted(migrations)?;
        let pending: Vec<&Migration> = ordered.iter().filter(|m| m.version > current).collect();
        self.apply(&pending)
    }

    fn apply(&self, pending: &[&Migration]) -> Result<Vec<i64>> {
        if pending.is_empty() {
            debug!("Schema is up to date");
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "Applying pending migrations");

        let mut ran = Vec::with_capacity(pending.len());
        for m in pending {
            info!(version = m.version, name = %m.name, "Applying migration");
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(&m.up)
                .with_context(|| format!("Migration {} ({}) failed", m.version, m.name))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, checksum, applied_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![m.version, m.name, m.checksum(), Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            ran.push(m.version);
        }

        info!(count = ran.len(), "Database migration completed");
        Ok(ran)
    }

    /// Revert applied migrations newer than `target`, newest first.
    ///
    /// Every migration to revert must have a rollback script; this is checked
    /// before anything runs.
    pub fn rollback_to(&self, migrations: &[Migration], target: i64) -> Result<Vec<i64>> {
        if target < 0 {
            bail!("Rollback target must not be negative");
        }
        let known: HashMap<i64, &Migration> = migrations.iter().map(|m| (m.version, m)).collect();
        let mut to_revert: Vec<AppliedMigration> = self
            .applied()?
            .into_iter()
            .filter(|a| a.version > target)
            .collect();
        to_revert.sort_by_key(|a| std::cmp::Reverse(a.version));

        let mut plan = Vec::with_capacity(to_revert.len());
        for record in &to_revert {
            let Some(m) = known.get(&record.version) else {
                bail!(
                    "Applied migration {} ({}) is unknown; cannot roll it back",
                    record.version,
                    record.name
                );
            };
            let Some(down) = m.down.as_deref() else {
                bail!("Migration {} ({}) has no rollback script", m.version, m.name);
            };
            plan.push((*m, down));
        }

        let mut reverted = Vec::with_capacity(plan.len());
        for (m, down) in plan {
            info!(version = m.version, name = %m.name, "Rolling back migration");
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(down)
                .with_context(|| format!("Rollback of {} ({}) failed", m.version, m.name))?;
            tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                params![m.version],
            )?;
            tx.commit()?;
            reverted.push(m.version);
        }
        Ok(reverted)
    }
}

fn sorted(migrations: &[Migration]) -> Result<Vec<Migration>> {
    let mut ordered = migrations.to_vec();
    ordered.sort_by_key(|m| m.version);
    if let Some(pair) = ordered.windows(2).find(|w| w[0].version == w[1].version) {
        bail!("Duplicate migration version {}", pair[0].version);
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    fn migration(version: i64, up: &str, down: Option<&str>) -> Migration {
        Migration {
            version,
            name: format!("m{version}"),
            up: up.to_string(),
            down: down.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_file_name() {
        let up = parse_file_name("001_initial_schema.sql").unwrap();
        assert_eq!(up.version, 1);
        assert_eq!(up.name, "initial_schema");
        assert_eq!(up.direction, Direction::Up);

        let down = parse_file_name("010_add_index.down.sql").unwrap();
        assert_eq!(down.version, 10);
        assert_eq!(down.name, "add_index");
        assert_eq!(down.direction, Direction::Down);

        let bare = parse_file_name("7.sql").unwrap();
        assert_eq!(bare.version, 7);

        assert!(parse_file_name("readme_first.sql").is_none());
        assert!(parse_file_name("001_schema.txt").is_none());
    }

    #[test]
    fn test_embedded_migrations_are_ordered_and_reversible() {
        let migrations = embedded();
        let versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(migrations.iter().all(|m| m.down.is_some()));
    }

    #[test]
    fn test_discover_orders_by_numeric_prefix_and_skips_unprefixed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("10_third.sql"), "CREATE TABLE c (id INTEGER);").unwrap();
        fs::write(dir.path().join("2_second.sql"), "CREATE TABLE b (id INTEGER);").unwrap();
        fs::write(dir.path().join("001_first.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
        fs::write(dir.path().join("001_first.down.sql"), "DROP TABLE a;").unwrap();
        fs::write(dir.path().join("notes.sql"), "garbage").unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let migrations = discover(dir.path()).unwrap();
        let versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(migrations[0].down.as_deref(), Some("DROP TABLE a;"));
        assert!(migrations[1].down.is_none());
    }

    #[test]
    fn test_discover_empty_dir_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("schema.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
        let err = discover(dir.path()).unwrap_err();
        assert!(err.to_string().contains("No valid SQL files"));
    }

    #[test]
    fn test_discover_rejects_orphan_rollback() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("001_a.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
        fs::write(dir.path().join("002_b.down.sql"), "DROP TABLE b;").unwrap();
        assert!(discover(dir.path()).is_err());
    }

    #[test]
    fn test_migrate_applies_pending_once() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();

        let applied = migrator.migrate(&embedded()).unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
        assert!(table_exists(&conn, "meals"));
        assert!(table_exists(&conn, "meal_history_view"));
        assert_eq!(migrator.current_version().unwrap(), 3);

        let again = migrator.migrate(&embedded()).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_migrate_stops_at_first_failure_and_rolls_it_back() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();
        let migrations = vec![
            migration(1, "CREATE TABLE a (id INTEGER);", None),
            migration(2, "CREATE TABLE b (id INTEGER); THIS IS NOT SQL;", None),
            migration(3, "CREATE TABLE c (id INTEGER);", None),
        ];

        let err = migrator.migrate(&migrations).unwrap_err();
        assert!(format!("{err:#}").contains("Migration 2"));
        assert!(table_exists(&conn, "a"));
        assert!(!table_exists(&conn, "b"));
        assert!(!table_exists(&conn, "c"));
        assert_eq!(migrator.current_version().unwrap(), 1);
    }

    #[test]
    fn test_migrate_detects_modified_script() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();
        migrator
            .migrate(&[migration(1, "CREATE TABLE a (id INTEGER);", None)])
            .unwrap();

        let err = migrator
            .migrate(&[migration(1, "CREATE TABLE a (id TEXT);", None)])
            .unwrap_err();
        assert!(err.to_string().contains("modified"));
    }

    #[test]
    fn test_upgrade_trusts_applied_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();
        migrator
            .migrate(&[migration(1, "-- local\nCREATE TABLE a (id INTEGER);", None)])
            .unwrap();

        let newer = [
            migration(1, "CREATE TABLE a (id INTEGER);", None),
            migration(2, "CREATE TABLE b (id INTEGER);", None),
        ];
        assert_eq!(migrator.upgrade(&newer).unwrap(), vec![2]);
        assert!(table_exists(&conn, "b"));
        assert!(migrator.upgrade(&newer).unwrap().is_empty());
    }

    #[test]
    fn test_rollback_to_reverts_newest_first() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();
        migrator.migrate(&embedded()).unwrap();

        let reverted = migrator.rollback_to(&embedded(), 1).unwrap();
        assert_eq!(reverted, vec![3, 2]);
        assert!(table_exists(&conn, "meals"));
        assert!(!table_exists(&conn, "side_dishes"));
        assert!(!table_exists(&conn, "meal_history"));
        assert_eq!(migrator.current_version().unwrap(), 1);

        // Re-applying brings the schema back.
        assert_eq!(migrator.migrate(&embedded()).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_rollback_requires_down_scripts() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();
        let migrations = vec![
            migration(1, "CREATE TABLE a (id INTEGER);", Some("DROP TABLE a;")),
            migration(2, "CREATE TABLE b (id INTEGER);", None),
        ];
        migrator.migrate(&migrations).unwrap();

        assert!(migrator.rollback_to(&migrations, 0).is_err());
        // Nothing was reverted.
        assert!(table_exists(&conn, "a"));
        assert!(table_exists(&conn, "b"));
    }

    #[test]
    fn test_status_reports_pending_and_applied() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();
        let all = embedded();
        migrator.migrate(&all[..1]).unwrap();

        let status = migrator.status(&all).unwrap();
        assert_eq!(status.len(), 3);
        assert!(status[0].applied);
        assert!(status[0].applied_at.is_some());
        assert!(!status[1].applied);
        assert!(!status[2].applied);
    }
}
