use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::Database;
use crate::models::{NewMeal, NewSideDish, validate_new_meal, validate_new_side_dish};

pub const MEALS_FILE: &str = "seed_meals.json";
pub const SIDE_DISHES_FILE: &str = "seed_sidedishes.json";

#[derive(Debug, Clone)]
pub struct SeedData {
    pub meals: Vec<NewMeal>,
    pub side_dishes: Vec<NewSideDish>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub meals_inserted: usize,
    pub meals_skipped: usize,
    pub side_dishes_inserted: usize,
    pub side_dishes_skipped: usize,
}

impl SeedData {
    /// The default catalogue shipped with the binary.
    pub fn embedded() -> Result<Self> {
        Self::parse(
            include_str!("../seeds/seed_meals.json"),
            include_str!("../seeds/seed_sidedishes.json"),
        )
    }

    /// Load `seed_meals.json` and `seed_sidedishes.json` from a directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let read = |file: &str| {
            let path = dir.join(file);
            fs::read_to_string(&path)
                .with_context(|| format!("Failed to read seed file: {}", path.display()))
        };
        Self::parse(&read(MEALS_FILE)?, &read(SIDE_DISHES_FILE)?)
    }

    fn parse(meals_json: &str, side_dishes_json: &str) -> Result<Self> {
        let meals: Vec<NewMeal> =
            serde_json::from_str(meals_json).with_context(|| format!("Invalid {MEALS_FILE}"))?;
        let side_dishes: Vec<NewSideDish> = serde_json::from_str(side_dishes_json)
            .with_context(|| format!("Invalid {SIDE_DISHES_FILE}"))?;

        let mut meals = meals
            .iter()
            .map(|m| validate_new_meal(m).with_context(|| format!("Invalid seed meal '{}'", m.name)))
            .collect::<Result<Vec<_>>>()?;
        let mut side_dishes = side_dishes
            .iter()
            .map(|s| {
                validate_new_side_dish(s)
                    .with_context(|| format!("Invalid seed side dish '{}'", s.name))
            })
            .collect::<Result<Vec<_>>>()?;
        meals.sort_by(|a, b| a.name.cmp(&b.name));
        side_dishes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(SeedData { meals, side_dishes })
    }
}

/// Insert seed records that are not already present (matched by name). Runs
/// in one transaction: a failure leaves the database unchanged.
pub fn seed(db: &Database, data: &SeedData) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();
    let tx = db.transaction()?;

    for side_dish in &data.side_dishes {
        if db.get_side_dish_by_name(&side_dish.name)?.is_some() {
            debug!(name = %side_dish.name, "Side dish already present");
            summary.side_dishes_skipped += 1;
            continue;
        }
        db.insert_side_dish(side_dish)?;
        summary.side_dishes_inserted += 1;
    }

    for meal in &data.meals {
        if db.get_meal_by_name(&meal.name)?.is_some() {
            debug!(name = %meal.name, "Meal already present");
            summary.meals_skipped += 1;
            continue;
        }
        db.insert_meal(meal)?;
        summary.meals_inserted += 1;
    }

    tx.commit().context("Failed to commit seed data")?;
    info!(
        meals = summary.meals_inserted,
        side_dishes = summary.side_dishes_inserted,
        skipped = summary.meals_skipped + summary.side_dishes_skipped,
        "Seeded database"
    );
    Ok(summary)
}
