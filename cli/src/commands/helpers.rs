use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use mealplan_core::models::{HistoryEntry, Meal, MealType, SideDish};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday")),
        },
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// Report a missing record and exit with status 2.
pub(crate) fn exit_not_found(message: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(message));
    } else {
        eprintln!("{message}");
    }
    process::exit(2);
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

pub(crate) fn format_types(types: &[MealType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn minutes(value: Option<i64>) -> String {
    value.map_or("-".into(), |m| format!("{m} min"))
}

pub(crate) fn print_meal_table(meals: &[Meal]) {
    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Types")]
        types: String,
        #[tabled(rename = "Freq")]
        frequency: String,
        #[tabled(rename = "Active")]
        active: String,
        #[tabled(rename = "Passive")]
        passive: String,
        #[tabled(rename = "Side")]
        side: &'static str,
    }

    let rows: Vec<MealRow> = meals
        .iter()
        .map(|m| MealRow {
            id: m.id,
            name: truncate(&m.name, 35),
            types: format_types(&m.meal_types),
            frequency: format!("{:.1}", m.frequency_factor),
            active: minutes(m.active_time),
            passive: minutes(m.passive_time),
            side: if m.has_side_dish { "yes" } else { "no" },
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_side_dish_table(side_dishes: &[SideDish]) {
    #[derive(Tabled)]
    struct SideDishRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Notes")]
        notes: String,
    }

    let rows: Vec<SideDishRow> = side_dishes
        .iter()
        .map(|s| SideDishRow {
            id: s.id,
            name: truncate(&s.name, 35),
            notes: s
                .notes
                .as_deref()
                .map(|n| truncate(n, 40))
                .unwrap_or_default(),
        })
        .collect();

    println!("{}", Table::new(&rows).with(Style::rounded()));
}

pub(crate) fn print_history_table(entries: &[HistoryEntry]) {
    #[derive(Tabled)]
    struct HistoryRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Side dish")]
        side_dish: String,
    }

    let rows: Vec<HistoryRow> = entries
        .iter()
        .map(|e| HistoryRow {
            id: e.id,
            date: e.date_eaten.to_string(),
            meal: truncate(&e.meal, 35),
            side_dish: e.side_dish.clone().unwrap_or_else(|| "-".into()),
        })
        .collect();

    println!("{}", Table::new(&rows).with(Style::rounded()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_none() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(None).unwrap(), today);
    }

    #[test]
    fn test_parse_date_keywords() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(Some("today".to_string())).unwrap(), today);
        assert_eq!(
            parse_date(Some("yesterday".to_string())).unwrap(),
            today - chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_iso() {
        let date = parse_date(Some("2024-01-15".to_string())).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(parse_date(Some("nope".to_string())).is_err());
        assert!(parse_date(Some("tomorrow".to_string())).is_err());
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("Karjalanpaisti", 20), "Karjalanpaisti");
        assert_eq!(truncate("Jauhelihaperunasoselaatikko", 10), "Jauheli...");
        assert_eq!(truncate("Pyttipannu äöå extra", 13), "Pyttipannu...");
    }

    #[test]
    fn test_format_types() {
        assert_eq!(
            format_types(&[MealType::Chicken, MealType::Vegetable]),
            "chicken, vegetable"
        );
    }

    #[test]
    fn test_json_error_escapes() {
        let out = json_error("Meal \"X\" not found");
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"], "Meal \"X\" not found");
    }
}
