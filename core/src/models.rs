use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Dinner category. A meal can belong to several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Meat,
    Chicken,
    Fish,
    Vegetable,
}

impl MealType {
    pub const ALL: [MealType; 4] = [
        MealType::Meat,
        MealType::Chicken,
        MealType::Fish,
        MealType::Vegetable,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MealType::Meat => "meat",
            MealType::Chicken => "chicken",
            MealType::Fish => "fish",
            MealType::Vegetable => "vegetable",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        MealType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid meal type '{s}'. Must be one of: {}",
                    MealType::ALL.map(MealType::as_str).join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meal {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub meal_types: Vec<MealType>,
    pub notes: Option<String>,
    pub frequency_factor: f64,
    /// Preparation (active) time in minutes.
    pub active_time: Option<i64>,
    /// Cooking (passive) time in minutes.
    pub passive_time: Option<i64>,
    pub has_side_dish: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Meal {
    #[must_use]
    pub fn is_type(&self, meal_type: MealType) -> bool {
        self.meal_types.contains(&meal_type)
    }
}

fn default_frequency_factor() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMeal {
    pub name: String,
    pub meal_types: Vec<MealType>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "default_frequency_factor")]
    pub frequency_factor: f64,
    #[serde(default)]
    pub active_time: Option<i64>,
    #[serde(default)]
    pub passive_time: Option<i64>,
    #[serde(default = "default_true")]
    pub has_side_dish: bool,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct UpdateMeal {
    pub name: Option<String>,
    pub meal_types: Option<Vec<MealType>>,
    pub notes: Option<Option<String>>,
    pub frequency_factor: Option<f64>,
    pub active_time: Option<Option<i64>>,
    pub passive_time: Option<Option<i64>>,
    pub has_side_dish: Option<bool>,
}

impl UpdateMeal {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.meal_types.is_none()
            && self.notes.is_none()
            && self.frequency_factor.is_none()
            && self.active_time.is_none()
            && self.passive_time.is_none()
            && self.has_side_dish.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideDish {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSideDish {
    pub name: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct UpdateSideDish {
    pub name: Option<String>,
    pub notes: Option<Option<String>>,
}

/// One eaten dinner, with the meal and side dish resolved to names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub id: i64,
    pub date_eaten: NaiveDate,
    pub meal: String,
    #[serde(default)]
    pub side_dish: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub date_eaten: NaiveDate,
    pub meal: String,
    #[serde(default)]
    pub side_dish: Option<String>,
}

// --- Plan types ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanItem {
    /// Day number within the plan, starting at 1.
    pub id: i64,
    pub meal_name: String,
    #[serde(default)]
    pub meal_type: Vec<MealType>,
    #[serde(default)]
    pub side_dish: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlan {
    pub plan: Vec<MealPlanItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub meals: i64,
    pub side_dishes: i64,
    pub meal_history: i64,
}

/// Point-in-time export of every table. History references meals and side
/// dishes by name so a snapshot can be restored into a fresh database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub meals: Vec<Meal>,
    #[serde(default)]
    pub side_dishes: Vec<SideDish>,
    #[serde(default)]
    pub meal_history: Vec<HistoryEntry>,
}

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

fn default_format_version() -> u32 {
    SNAPSHOT_FORMAT_VERSION
}

impl Snapshot {
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn counts(&self) -> TableCounts {
        TableCounts {
            meals: self.meals.len() as i64,
            side_dishes: self.side_dishes.len() as i64,
            meal_history: self.meal_history.len() as i64,
        }
    }
}

// --- Validation ---

/// Deduplicate and sort meal types; at least one is required.
pub fn normalize_meal_types(types: &[MealType]) -> Result<Vec<MealType>> {
    let mut out = types.to_vec();
    out.sort_unstable();
    out.dedup();
    if out.is_empty() {
        bail!("A meal needs at least one meal type");
    }
    Ok(out)
}

pub fn parse_meal_types(raw: &str) -> Result<Vec<MealType>> {
    let types = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(MealType::from_str)
        .collect::<Result<Vec<_>>>()?;
    normalize_meal_types(&types)
}

pub fn validate_name(name: &str, what: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("{what} name must not be empty");
    }
    Ok(trimmed.to_string())
}

fn validate_minutes(value: Option<i64>, field: &str) -> Result<()> {
    if value.is_some_and(|v| v < 0) {
        bail!("{field} must not be negative");
    }
    Ok(())
}

fn validate_frequency_factor(value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("frequency_factor must be greater than 0");
    }
    Ok(())
}

/// Validate a new meal, returning it with a trimmed name and normalized types.
pub fn validate_new_meal(meal: &NewMeal) -> Result<NewMeal> {
    let name = validate_name(&meal.name, "Meal")?;
    let meal_types = normalize_meal_types(&meal.meal_types)?;
    validate_frequency_factor(meal.frequency_factor)?;
    validate_minutes(meal.active_time, "active_time")?;
    validate_minutes(meal.passive_time, "passive_time")?;
    Ok(NewMeal {
        name,
        meal_types,
        ..meal.clone()
    })
}

pub fn validate_update_meal(update: &UpdateMeal) -> Result<UpdateMeal> {
    let name = update
        .name
        .as_deref()
        .map(|n| validate_name(n, "Meal"))
        .transpose()?;
    let meal_types = update
        .meal_types
        .as_deref()
        .map(normalize_meal_types)
        .transpose()?;
    if let Some(factor) = update.frequency_factor {
        validate_frequency_factor(factor)?;
    }
    validate_minutes(update.active_time.flatten(), "active_time")?;
    validate_minutes(update.passive_time.flatten(), "passive_time")?;
    Ok(UpdateMeal {
        name,
        meal_types,
        ..update.clone()
    })
}

pub fn validate_new_side_dish(side_dish: &NewSideDish) -> Result<NewSideDish> {
    Ok(NewSideDish {
        name: validate_name(&side_dish.name, "Side dish")?,
        notes: side_dish.notes.clone(),
    })
}
