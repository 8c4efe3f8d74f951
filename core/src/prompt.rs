use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Meal, MealType, SideDish};
use crate::rules::PlanRules;

pub struct PromptInput<'a> {
    pub today: NaiveDate,
    pub rules: &'a PlanRules,
    pub banned: &'a BTreeSet<String>,
    pub meals: &'a [Meal],
    pub side_dishes: &'a [SideDish],
}

// What the model sees of a meal: no ids or timestamps.
#[derive(Serialize)]
struct PromptMeal<'a> {
    name: &'a str,
    meal_types: &'a [MealType],
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    frequency_factor: f64,
    has_side_dish: bool,
}

#[derive(Serialize)]
struct PromptSideDish<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

fn json_lines<T: Serialize>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .filter_map(|item| serde_json::to_string(&item).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn or_none(block: String) -> String {
    if block.is_empty() {
        "(none)".to_string()
    } else {
        block
    }
}

/// Render the planning rules as instructions for the model.
#[must_use]
pub fn system_prompt(input: &PromptInput<'_>) -> String {
    let days = input.rules.days;

    let banned = or_none(
        input
            .banned
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
    );
    let foods = or_none(json_lines(input.meals.iter().map(|m| PromptMeal {
        name: &m.name,
        meal_types: &m.meal_types,
        notes: m.notes.as_deref(),
        frequency_factor: m.frequency_factor,
        has_side_dish: m.has_side_dish,
    })));
    let sides = or_none(json_lines(input.side_dishes.iter().map(|s| PromptSideDish {
        name: &s.name,
        notes: s.notes.as_deref(),
    })));

    let mut quotas = String::new();
    for (category, min) in &input.rules.min_per_category {
        if *min > 0 {
            let _ = writeln!(quotas, "     • {min} {category}");
        }
    }

    let recency = match input.rules.recent_days {
        Some(window) => format!(
            "   - The banned list holds every meal eaten in the last {window} days\n   - Never select meals appearing in banned list"
        ),
        None => "   - Never select meals appearing in banned list".to_string(),
    };

    format!(
        r#"**Role**: You are an intelligent meal planning assistant. Your task is to generate a {days}-day dinner plan based on the user's meal history.

**Current Date Reference:** {today}

**Banned Meals**:
{banned}

**Available Foods**:
{foods}

**Available Side Dishes**:
{sides}

**Core Selection Rules:**

1. RECENCY FILTER (STRICT):
{recency}
   - Do not repeat a meal within the plan

2. CATEGORY REQUIREMENTS:
   - Must include minimum:
{quotas}   - Multi-type foods count for all their categories

3. SIDE DISH LOGIC:
   - ONLY consider sides when 'has_side_dish: true'
   - When enabled: Select exactly one from valid sides
   - When disabled: No side dish reference whatsoever

**Absolute Prohibitions:**
✗ No meal or side dish invention (strict list only)
✗ No category omissions
✗ No modification of selection rules

**Output Format:**
Respond with a single JSON object and nothing else:
{{"plan": [{{"id": 1, "meal_name": "<name from Available Foods>", "meal_type": ["<its meal types>"], "side_dish": "<name from Available Side Dishes or null>", "notes": "<optional short note or null>"}}]}}
The plan array must contain exactly {days} items with ids 1 to {days}."#,
        today = input.today.format("%Y-%m-%d"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meal(name: &str, types: &[MealType], has_side_dish: bool) -> Meal {
        Meal {
            id: 1,
            name: name.to_string(),
            meal_types: types.to_vec(),
            notes: None,
            frequency_factor: 1.0,
            active_time: None,
            passive_time: None,
            has_side_dish,
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            updated_at: "2024-01-01T00:00:00+00:00".to_string(),
        }
    }

    fn render(rules: &PlanRules, banned: &BTreeSet<String>, meals: &[Meal]) -> String {
        let sides = vec![SideDish {
            id: 1,
            name: "Riisi".to_string(),
            notes: None,
            created_at: String::new(),
            updated_at: String::new(),
        }];
        system_prompt(&PromptInput {
            today: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            rules,
            banned,
            meals,
            side_dishes: &sides,
        })
    }

    #[test]
    fn test_prompt_contains_context() {
        let banned: BTreeSet<String> = ["Tacos".to_string()].into();
        let meals = vec![
            meal("Tacos", &[MealType::Meat], true),
            meal("Kanakeitto", &[MealType::Chicken, MealType::Vegetable], false),
        ];
        let prompt = render(&PlanRules::default(), &banned, &meals);

        assert!(prompt.contains("generate a 7-day dinner plan"));
        assert!(prompt.contains("**Current Date Reference:** 2024-03-09"));
        assert!(prompt.contains("**Banned Meals**:\nTacos\n"));
        assert!(prompt.contains(
            r#"{"name":"Kanakeitto","meal_types":["chicken","vegetable"],"frequency_factor":1.0,"has_side_dish":false}"#
        ));
        assert!(prompt.contains(r#"{"name":"Riisi"}"#));
        assert!(prompt.contains("• 1 fish"));
        assert!(prompt.contains("last 14 days"));
        assert!(prompt.contains("exactly 7 items"));
        // No ids or timestamps leak into the prompt.
        assert!(!prompt.contains("created_at"));
    }

    #[test]
    fn test_prompt_empty_banned_list_and_custom_rules() {
        let mut rules = PlanRules {
            days: 5,
            recent_days: None,
            ..PlanRules::default()
        };
        rules.min_per_category.insert(MealType::Fish, 2);
        rules.min_per_category.insert(MealType::Meat, 0);
        let prompt = render(&rules, &BTreeSet::new(), &[]);

        assert!(prompt.contains("**Banned Meals**:\n(none)\n"));
        assert!(prompt.contains("• 2 fish"));
        assert!(!prompt.contains("• 0 meat"));
        assert!(!prompt.contains("last"));
        assert!(prompt.contains("5-day dinner plan"));
    }
}
