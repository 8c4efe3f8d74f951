use anyhow::Result;
use chrono::Local;

use mealplan_core::db::Database;
use mealplan_core::models::NewHistoryEntry;
use mealplan_core::rules::window_start;

use super::helpers::{exit_not_found, parse_date, print_history_table, print_json};

pub(crate) fn cmd_history_log(
    db: &Database,
    meal: &str,
    side_dish: Option<String>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let entry = db.add_history(&NewHistoryEntry {
        date_eaten: parse_date(date)?,
        meal: meal.trim().to_string(),
        side_dish: side_dish
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })?;

    if json {
        print_json(&entry)?;
    } else {
        match &entry.side_dish {
            Some(side) => println!(
                "Logged {} with {} on {} (entry {})",
                entry.meal, side, entry.date_eaten, entry.id
            ),
            None => println!(
                "Logged {} on {} (entry {})",
                entry.meal, entry.date_eaten, entry.id
            ),
        }
    }
    Ok(())
}

pub(crate) fn cmd_history_list(db: &Database, days: Option<u32>, json: bool) -> Result<()> {
    let since = days.and_then(|d| window_start(Local::now().date_naive(), i64::from(d)));
    let entries = db.list_history(since)?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No meals logged yet.");
        return Ok(());
    }
    print_history_table(&entries);
    Ok(())
}

pub(crate) fn cmd_history_remove(db: &Database, id: i64, json: bool) -> Result<()> {
    if !db.delete_history(id)? {
        exit_not_found(&format!("History entry {id} not found"), json);
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted history entry {id}");
    }
    Ok(())
}
