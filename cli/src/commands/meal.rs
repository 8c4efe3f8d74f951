use anyhow::{Result, bail};

use mealplan_core::db::Database;
use mealplan_core::models::{
    MealType, NewMeal, NewSideDish, parse_meal_types, validate_new_meal, validate_new_side_dish,
};

use super::helpers::{
    exit_not_found, format_types, print_json, print_meal_table, print_side_dish_table,
};

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_meal_add(
    db: &Database,
    name: &str,
    types: &str,
    notes: Option<String>,
    frequency: f64,
    active_time: Option<i64>,
    passive_time: Option<i64>,
    no_side_dish: bool,
    json: bool,
) -> Result<()> {
    let meal = validate_new_meal(&NewMeal {
        name: name.to_string(),
        meal_types: parse_meal_types(types)?,
        notes,
        frequency_factor: frequency,
        active_time,
        passive_time,
        has_side_dish: !no_side_dish,
    })?;
    if db.get_meal_by_name(&meal.name)?.is_some() {
        bail!("Meal '{}' already exists", meal.name);
    }
    let meal = db.insert_meal(&meal)?;

    if json {
        print_json(&meal)?;
    } else {
        println!(
            "Added meal {}: {} ({})",
            meal.id,
            meal.name,
            format_types(&meal.meal_types)
        );
    }
    Ok(())
}

pub(crate) fn cmd_meal_list(db: &Database, meal_type: Option<&str>, json: bool) -> Result<()> {
    let mut meals = db.list_meals()?;
    if let Some(t) = meal_type {
        let wanted: MealType = t.parse()?;
        meals.retain(|m| m.is_type(wanted));
    }

    if json {
        return print_json(&meals);
    }
    if meals.is_empty() {
        println!("No meals found. Run `mealplan seed` or `mealplan meal add`.");
        return Ok(());
    }
    print_meal_table(&meals);
    Ok(())
}

pub(crate) fn cmd_meal_show(db: &Database, name: &str, json: bool) -> Result<()> {
    let Some(meal) = db.get_meal_by_name(name.trim())? else {
        exit_not_found(&format!("Meal '{name}' not found"), json);
    };

    if json {
        return print_json(&meal);
    }
    println!("{} (ID {})", meal.name, meal.id);
    println!("  Types:      {}", format_types(&meal.meal_types));
    println!("  Frequency:  {:.1}", meal.frequency_factor);
    if let Some(active) = meal.active_time {
        println!("  Active:     {active} min");
    }
    if let Some(passive) = meal.passive_time {
        println!("  Passive:    {passive} min");
    }
    println!(
        "  Side dish:  {}",
        if meal.has_side_dish { "yes" } else { "no" }
    );
    if let Some(notes) = &meal.notes {
        println!("  Notes:      {notes}");
    }
    Ok(())
}

pub(crate) fn cmd_meal_remove(db: &Database, name: &str, json: bool) -> Result<()> {
    let Some(meal) = db.get_meal_by_name(name.trim())? else {
        exit_not_found(&format!("Meal '{name}' not found"), json);
    };
    db.delete_meal(meal.id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": meal.id }));
    } else {
        println!("Removed meal '{}' and its history", meal.name);
    }
    Ok(())
}

pub(crate) fn cmd_side_add(
    db: &Database,
    name: &str,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let side_dish = validate_new_side_dish(&NewSideDish {
        name: name.to_string(),
        notes,
    })?;
    if db.get_side_dish_by_name(&side_dish.name)?.is_some() {
        bail!("Side dish '{}' already exists", side_dish.name);
    }
    let side_dish = db.insert_side_dish(&side_dish)?;
    if json {
        print_json(&side_dish)?;
    } else {
        println!("Added side dish {}: {}", side_dish.id, side_dish.name);
    }
    Ok(())
}

pub(crate) fn cmd_side_list(db: &Database, json: bool) -> Result<()> {
    let side_dishes = db.list_side_dishes()?;
    if json {
        return print_json(&side_dishes);
    }
    if side_dishes.is_empty() {
        println!("No side dishes found.");
        return Ok(());
    }
    print_side_dish_table(&side_dishes);
    Ok(())
}

pub(crate) fn cmd_side_remove(db: &Database, name: &str, json: bool) -> Result<()> {
    let Some(side_dish) = db.get_side_dish_by_name(name.trim())? else {
        exit_not_found(&format!("Side dish '{name}' not found"), json);
    };
    db.delete_side_dish(side_dish.id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": side_dish.id }));
    } else {
        println!("Removed side dish '{}'", side_dish.name);
    }
    Ok(())
}
