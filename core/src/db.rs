use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::migrations::{self, Migration, MigrationStatus, Migrator};
use crate::models::{
    HistoryEntry, Meal, MealType, NewHistoryEntry, NewMeal, NewSideDish, SNAPSHOT_FORMAT_VERSION,
    SideDish, Snapshot, TableCounts, UpdateMeal, UpdateSideDish,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

const MEAL_COLUMNS: &str = "id, name, meal_types, notes, frequency_factor, active_time, \
                            passive_time, has_side_dish, created_at, updated_at";

pub struct Database {
    conn: Connection,
}

/// Problems with the content of a snapshot, as opposed to failures of the
/// database itself.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Unsupported snapshot format version {found} (newest supported is {newest})", newest = SNAPSHOT_FORMAT_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("History entry on {date} refers to unknown meal '{name}'")]
    UnknownMeal { date: NaiveDate, name: String },

    #[error("History entry on {date} refers to unknown side dish '{name}'")]
    UnknownSideDish { date: NaiveDate, name: String },
}

/// True when the error chain contains a SQLite constraint failure (duplicate
/// name, failed CHECK, dangling reference).
#[must_use]
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
        )
    })
}

impl Database {
    fn connect(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Database { conn })
    }

    /// Open and bring the schema up to the built-in version. Migrations
    /// already recorded are not re-checked, so a database set up from an
    /// external migrations directory keeps working.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Self::open_unmigrated(path)?;
        Migrator::new(&db.conn)?.upgrade(&migrations::embedded())?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self::connect(Connection::open_in_memory()?)?;
        Migrator::new(&db.conn)?.upgrade(&migrations::embedded())?;
        Ok(db)
    }

    /// Open without touching the schema.
    pub fn open_unmigrated(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::connect(conn)
    }

    // --- Schema ---

    pub fn apply_migrations(&self, migrations: &[Migration]) -> Result<Vec<i64>> {
        Migrator::new(&self.conn)?.migrate(migrations)
    }

    pub fn rollback_migrations(&self, migrations: &[Migration], target: i64) -> Result<Vec<i64>> {
        Migrator::new(&self.conn)?.rollback_to(migrations, target)
    }

    pub fn migration_status(&self, migrations: &[Migration]) -> Result<Vec<MigrationStatus>> {
        Migrator::new(&self.conn)?.status(migrations)
    }

    // --- Row mapping helpers ---

    // Expects MEAL_COLUMNS order.
    fn meal_from_row(row: &rusqlite::Row) -> rusqlite::Result<Meal> {
        let types_json: String = row.get(2)?;
        let meal_types: Vec<MealType> = serde_json::from_str(&types_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Meal {
            id: row.get(0)?,
            name: row.get(1)?,
            meal_types,
            notes: row.get(3)?,
            frequency_factor: row.get(4)?,
            active_time: row.get(5)?,
            passive_time: row.get(6)?,
            has_side_dish: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn side_dish_from_row(row: &rusqlite::Row) -> rusqlite::Result<SideDish> {
        Ok(SideDish {
            id: row.get(0)?,
            name: row.get(1)?,
            notes: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    // 0: id, 1: date_eaten, 2: meal, 3: side_dish
    fn history_from_row(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
        let date: String = row.get(1)?;
        let date_eaten = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(HistoryEntry {
            id: row.get(0)?,
            date_eaten,
            meal: row.get(2)?,
            side_dish: row.get(3)?,
        })
    }

    fn types_json(types: &[MealType]) -> Result<String> {
        serde_json::to_string(types).context("Failed to encode meal types")
    }

    // --- Meals ---

    pub fn insert_meal(&self, meal: &NewMeal) -> Result<Meal> {
        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO meals (name, meal_types, notes, frequency_factor, active_time, passive_time, has_side_dish, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    meal.name,
                    Self::types_json(&meal.meal_types)?,
                    meal.notes,
                    meal.frequency_factor,
                    meal.active_time,
                    meal.passive_time,
                    meal.has_side_dish,
                    now,
                    now,
                ],
            )
            .with_context(|| format!("Failed to insert meal '{}'", meal.name))?;
        let id = self.conn.last_insert_rowid();
        self.get_meal_by_id(id)
    }

    pub fn get_meal_by_id(&self, id: i64) -> Result<Meal> {
        self.conn
            .query_row(
                &format!("SELECT {MEAL_COLUMNS} FROM meals WHERE id = ?1"),
                params![id],
                Self::meal_from_row,
            )
            .context("Meal not found")
    }

    pub fn get_meal_by_name(&self, name: &str) -> Result<Option<Meal>> {
        let meal = self
            .conn
            .query_row(
                &format!("SELECT {MEAL_COLUMNS} FROM meals WHERE name = ?1"),
                params![name],
                Self::meal_from_row,
            )
            .optional()?;
        Ok(meal)
    }

    pub fn list_meals(&self) -> Result<Vec<Meal>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {MEAL_COLUMNS} FROM meals ORDER BY name"))?;
        let meals = stmt
            .query_map([], Self::meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(meals)
    }

    pub fn update_meal(&self, id: i64, update: &UpdateMeal) -> Result<Meal> {
        let mut meal = self.get_meal_by_id(id)?;
        if update.is_empty() {
            return Ok(meal);
        }

        if let Some(name) = &update.name {
            meal.name.clone_from(name);
        }
        if let Some(types) = &update.meal_types {
            meal.meal_types.clone_from(types);
        }
        if let Some(notes) = &update.notes {
            meal.notes.clone_from(notes);
        }
        if let Some(factor) = update.frequency_factor {
            meal.frequency_factor = factor;
        }
        if let Some(active) = update.active_time {
            meal.active_time = active;
        }
        if let Some(passive) = update.passive_time {
            meal.passive_time = passive;
        }
        if let Some(has_side_dish) = update.has_side_dish {
            meal.has_side_dish = has_side_dish;
        }

        self.conn
            .execute(
                "UPDATE meals SET name = ?1, meal_types = ?2, notes = ?3, frequency_factor = ?4,
                        active_time = ?5, passive_time = ?6, has_side_dish = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    meal.name,
                    Self::types_json(&meal.meal_types)?,
                    meal.notes,
                    meal.frequency_factor,
                    meal.active_time,
                    meal.passive_time,
                    meal.has_side_dish,
                    Local::now().to_rfc3339(),
                    id,
                ],
            )
            .with_context(|| format!("Failed to update meal {id}"))?;
        self.get_meal_by_id(id)
    }

    /// Deleting a meal also removes its history entries.
    pub fn delete_meal(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM meals WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // --- Side dishes ---

    pub fn insert_side_dish(&self, side_dish: &NewSideDish) -> Result<SideDish> {
        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO side_dishes (name, notes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![side_dish.name, side_dish.notes, now, now],
            )
            .with_context(|| format!("Failed to insert side dish '{}'", side_dish.name))?;
        let id = self.conn.last_insert_rowid();
        self.get_side_dish_by_id(id)
    }

    pub fn get_side_dish_by_id(&self, id: i64) -> Result<SideDish> {
        self.conn
            .query_row(
                "SELECT id, name, notes, created_at, updated_at FROM side_dishes WHERE id = ?1",
                params![id],
                Self::side_dish_from_row,
            )
            .context("Side dish not found")
    }

    pub fn get_side_dish_by_name(&self, name: &str) -> Result<Option<SideDish>> {
        let side_dish = self
            .conn
            .query_row(
                "SELECT id, name, notes, created_at, updated_at FROM side_dishes WHERE name = ?1",
                params![name],
                Self::side_dish_from_row,
            )
            .optional()?;
        Ok(side_dish)
    }

    pub fn list_side_dishes(&self) -> Result<Vec<SideDish>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, notes, created_at, updated_at FROM side_dishes ORDER BY name",
        )?;
        let side_dishes = stmt
            .query_map([], Self::side_dish_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(side_dishes)
    }

    pub fn update_side_dish(&self, id: i64, update: &UpdateSideDish) -> Result<SideDish> {
        let mut side_dish = self.get_side_dish_by_id(id)?;
        if update.name.is_none() && update.notes.is_none() {
            return Ok(side_dish);
        }
        if let Some(name) = &update.name {
            side_dish.name.clone_from(name);
        }
        if let Some(notes) = &update.notes {
            side_dish.notes.clone_from(notes);
        }
        self.conn
            .execute(
                "UPDATE side_dishes SET name = ?1, notes = ?2, updated_at = ?3 WHERE id = ?4",
                params![side_dish.name, side_dish.notes, Local::now().to_rfc3339(), id],
            )
            .with_context(|| format!("Failed to update side dish {id}"))?;
        self.get_side_dish_by_id(id)
    }

    /// History entries that referenced the side dish keep the meal and lose
    /// the side dish.
    pub fn delete_side_dish(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM side_dishes WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // --- History ---

    pub fn add_history(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry> {
        let meal = self
            .get_meal_by_name(&entry.meal)?
            .ok_or_else(|| anyhow!("Meal '{}' not found", entry.meal))?;
        let side_dish_id = match entry.side_dish.as_deref() {
            Some(name) => Some(
                self.get_side_dish_by_name(name)?
                    .ok_or_else(|| anyhow!("Side dish '{name}' not found"))?
                    .id,
            ),
            None => None,
        };

        self.conn.execute(
            "INSERT INTO meal_history (date_eaten, meal_id, side_dish_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.date_eaten.format(DATE_FORMAT).to_string(),
                meal.id,
                side_dish_id,
                Local::now().to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_history_entry(id)
    }

    pub fn get_history_entry(&self, id: i64) -> Result<HistoryEntry> {
        self.conn
            .query_row(
                "SELECT id, date_eaten, meal, side_dish FROM meal_history_view WHERE id = ?1",
                params![id],
                Self::history_from_row,
            )
            .context("History entry not found")
    }

    /// History newest first, optionally limited to entries on or after `since`.
    pub fn list_history(&self, since: Option<NaiveDate>) -> Result<Vec<HistoryEntry>> {
        let since = since.map(|d| d.format(DATE_FORMAT).to_string());
        let mut stmt = self.conn.prepare(
            "SELECT id, date_eaten, meal, side_dish FROM meal_history_view
             WHERE ?1 IS NULL OR date_eaten >= ?1
             ORDER BY date_eaten DESC, id",
        )?;
        let entries = stmt
            .query_map(params![since], Self::history_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_history(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM meal_history WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // --- Whole-database operations ---

    pub fn counts(&self) -> Result<TableCounts> {
        let count = |table: &str| -> Result<i64> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?)
        };
        Ok(TableCounts {
            meals: count("meals")?,
            side_dishes: count("side_dishes")?,
            meal_history: count("meal_history")?,
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.counts()? == TableCounts::default())
    }

    /// Start a transaction on the shared connection. Every method called on
    /// this `Database` while the guard lives runs inside it; dropping the
    /// guard without committing rolls back.
    pub fn transaction(&self) -> Result<rusqlite::Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    fn delete_all_rows(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM meal_history;
             DELETE FROM meals;
             DELETE FROM side_dishes;
             DELETE FROM sqlite_sequence WHERE name IN ('meal_history', 'meals', 'side_dishes');",
        )?;
        Ok(())
    }

    /// Remove every row from every table, in dependency order.
    pub fn truncate_all(&self) -> Result<TableCounts> {
        let before = self.counts()?;
        let tx = self.transaction()?;
        self.delete_all_rows().context("Failed to truncate tables")?;
        tx.commit()?;
        info!(
            meals = before.meals,
            side_dishes = before.side_dishes,
            history = before.meal_history,
            "Truncated all tables"
        );
        Ok(before)
    }

    pub fn export_snapshot(&self) -> Result<Snapshot> {
        let tx = self.transaction()?;
        let snapshot = Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            meals: self.list_meals()?,
            side_dishes: self.list_side_dishes()?,
            meal_history: self.list_history(None)?,
        };
        tx.commit()?;
        debug!(
            meals = snapshot.meals.len(),
            side_dishes = snapshot.side_dishes.len(),
            history = snapshot.meal_history.len(),
            "Exported snapshot"
        );
        Ok(snapshot)
    }

    /// Replace the whole database content with a snapshot. Either every row
    /// is restored or nothing changes.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<TableCounts> {
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.format_version,
            }
            .into());
        }

        let tx = self.transaction()?;
        self.delete_all_rows()?;

        let now = Local::now().to_rfc3339();
        let stamp = |value: &str| {
            if value.is_empty() {
                now.clone()
            } else {
                value.to_string()
            }
        };

        let mut meal_ids: HashMap<&str, i64> = HashMap::new();
        // Records exported without ids get fresh ones.
        for meal in &snapshot.meals {
            let created_at = stamp(&meal.created_at);
            let updated_at = stamp(&meal.updated_at);
            self.conn
                .execute(
                    "INSERT INTO meals (id, name, meal_types, notes, frequency_factor, active_time, passive_time, has_side_dish, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        (meal.id > 0).then_some(meal.id),
                        meal.name,
                        Self::types_json(&meal.meal_types)?,
                        meal.notes,
                        meal.frequency_factor,
                        meal.active_time,
                        meal.passive_time,
                        meal.has_side_dish,
                        created_at,
                        updated_at,
                    ],
                )
                .with_context(|| format!("Failed to restore meal '{}'", meal.name))?;
            meal_ids.insert(meal.name.as_str(), self.conn.last_insert_rowid());
        }

        let mut side_dish_ids: HashMap<&str, i64> = HashMap::new();
        for side_dish in &snapshot.side_dishes {
            let created_at = stamp(&side_dish.created_at);
            let updated_at = stamp(&side_dish.updated_at);
            self.conn
                .execute(
                    "INSERT INTO side_dishes (id, name, notes, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        (side_dish.id > 0).then_some(side_dish.id),
                        side_dish.name,
                        side_dish.notes,
                        created_at,
                        updated_at
                    ],
                )
                .with_context(|| format!("Failed to restore side dish '{}'", side_dish.name))?;
            side_dish_ids.insert(side_dish.name.as_str(), self.conn.last_insert_rowid());
        }

        for entry in &snapshot.meal_history {
            let meal_id =
                *meal_ids
                    .get(entry.meal.as_str())
                    .ok_or_else(|| SnapshotError::UnknownMeal {
                        date: entry.date_eaten,
                        name: entry.meal.clone(),
                    })?;
            let side_dish_id = match entry.side_dish.as_deref() {
                Some(name) => Some(*side_dish_ids.get(name).ok_or_else(|| {
                    SnapshotError::UnknownSideDish {
                        date: entry.date_eaten,
                        name: name.to_string(),
                    }
                })?),
                None => None,
            };
            let id = (entry.id > 0).then_some(entry.id);
            self.conn.execute(
                "INSERT INTO meal_history (id, date_eaten, meal_id, side_dish_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    entry.date_eaten.format(DATE_FORMAT).to_string(),
                    meal_id,
                    side_dish_id,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        let counts = snapshot.counts();
        info!(
            meals = counts.meals,
            side_dishes = counts.side_dishes,
            history = counts.meal_history,
            "Restored snapshot"
        );
        Ok(counts)
    }
}
