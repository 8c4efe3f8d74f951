//! Planning constraints as code.
//!
//! The same rules the prompt spells out for the model, checked
//! deterministically: the recency filter, per-category minimums, and
//! side-dish eligibility. `feasibility` tells up front whether the catalogue
//! can satisfy the quotas at all; `check_plan` audits a finished plan.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{Result, bail};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use thiserror::Error;

use crate::models::{HistoryEntry, Meal, MealPlan, MealType, SideDish};

pub const MAX_PLAN_DAYS: usize = 31;
pub const DEFAULT_PLAN_DAYS: usize = 7;
pub const DEFAULT_RECENT_DAYS: i64 = 14;
pub const MAX_RECENT_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanRules {
    pub days: usize,
    /// Meals eaten within this many days before today are banned. `None`
    /// bans everything in the history.
    pub recent_days: Option<i64>,
    pub min_per_category: BTreeMap<MealType, usize>,
}

impl Default for PlanRules {
    fn default() -> Self {
        Self {
            days: DEFAULT_PLAN_DAYS,
            recent_days: Some(DEFAULT_RECENT_DAYS),
            min_per_category: MealType::ALL.into_iter().map(|t| (t, 1)).collect(),
        }
    }
}

impl PlanRules {
    pub fn validate(&self) -> Result<()> {
        if self.days == 0 || self.days > MAX_PLAN_DAYS {
            bail!("days must be between 1 and {MAX_PLAN_DAYS}");
        }
        if self
            .recent_days
            .is_some_and(|d| !(0..=MAX_RECENT_DAYS).contains(&d))
        {
            bail!("recent_days must be between 0 and {MAX_RECENT_DAYS}");
        }
        // A multi-type meal fills several quotas, so only a single quota
        // larger than the plan is impossible outright.
        if let Some((category, min)) = self
            .min_per_category
            .iter()
            .find(|(_, min)| **min > self.days)
        {
            bail!(
                "Cannot require {min} {category} meals in a {}-day plan",
                self.days
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("plan has {found} days, expected {expected}")]
    WrongLength { expected: usize, found: usize },

    #[error("day {day}: '{meal}' is not in the meal list")]
    UnknownMeal { day: i64, meal: String },

    #[error("day {day}: '{meal}' was eaten recently")]
    BannedMeal { day: i64, meal: String },

    #[error("day {day}: '{meal}' is already planned for an earlier day")]
    DuplicateMeal { day: i64, meal: String },

    #[error("needs at least {required} {category} meal(s), found {found}")]
    CategoryShortfall {
        category: MealType,
        required: usize,
        found: usize,
    },

    #[error("day {day}: side dish '{side_dish}' is not in the side dish list")]
    UnknownSideDish { day: i64, side_dish: String },

    #[error("day {day}: '{meal}' needs a side dish")]
    MissingSideDish { day: i64, meal: String },

    #[error("day {day}: '{meal}' is served without a side dish, got '{side_dish}'")]
    UnexpectedSideDish {
        day: i64,
        meal: String,
        side_dish: String,
    },
}

/// First day of a window reaching `days` back from `today`. `None` when the
/// window runs off the calendar, which callers treat as the whole history.
#[must_use]
pub fn window_start(today: NaiveDate, days: i64) -> Option<NaiveDate> {
    Duration::try_days(days).and_then(|d| today.checked_sub_signed(d))
}

/// Names of meals eaten in the `window` days up to and including `today`.
#[must_use]
pub fn banned_meals(
    history: &[HistoryEntry],
    today: NaiveDate,
    window: Option<i64>,
) -> BTreeSet<String> {
    let cutoff = window.and_then(|days| window_start(today, days));
    history
        .iter()
        .filter(|h| cutoff.is_none_or(|c| h.date_eaten >= c) && h.date_eaten <= today)
        .map(|h| h.meal.clone())
        .collect()
}

#[must_use]
pub fn eligible_meals<'m>(meals: &'m [Meal], banned: &BTreeSet<String>) -> Vec<&'m Meal> {
    meals.iter().filter(|m| !banned.contains(&m.name)).collect()
}

fn count_categories<'m>(meals: impl IntoIterator<Item = &'m Meal>) -> BTreeMap<MealType, usize> {
    let mut counts: BTreeMap<MealType, usize> = BTreeMap::new();
    for meal in meals {
        for t in &meal.meal_types {
            *counts.entry(*t).or_default() += 1;
        }
    }
    counts
}

fn shortfalls(counts: &BTreeMap<MealType, usize>, rules: &PlanRules) -> Vec<Violation> {
    rules
        .min_per_category
        .iter()
        .filter_map(|(category, required)| {
            let found = counts.get(category).copied().unwrap_or(0);
            (found < *required).then_some(Violation::CategoryShortfall {
                category: *category,
                required: *required,
                found,
            })
        })
        .collect()
}

/// Quotas the non-banned catalogue cannot fill, plus a length problem when
/// there are fewer eligible meals than plan days.
#[must_use]
pub fn feasibility(meals: &[Meal], banned: &BTreeSet<String>, rules: &PlanRules) -> Vec<Violation> {
    let eligible = eligible_meals(meals, banned);
    let mut out = Vec::new();
    if eligible.len() < rules.days {
        out.push(Violation::WrongLength {
            expected: rules.days,
            found: eligible.len(),
        });
    }
    out.extend(shortfalls(&count_categories(eligible), rules));
    out
}

/// Audit a plan against the catalogue. Categories and side-dish eligibility
/// come from the stored meals, never from what the model claimed.
#[must_use]
pub fn check_plan(
    plan: &MealPlan,
    meals: &[Meal],
    side_dishes: &[SideDish],
    banned: &BTreeSet<String>,
    rules: &PlanRules,
) -> Vec<Violation> {
    let catalogue: HashMap<&str, &Meal> = meals.iter().map(|m| (m.name.as_str(), m)).collect();
    let sides: HashSet<&str> = side_dishes.iter().map(|s| s.name.as_str()).collect();

    let mut out = Vec::new();
    if plan.plan.len() != rules.days {
        out.push(Violation::WrongLength {
            expected: rules.days,
            found: plan.plan.len(),
        });
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut planned: Vec<&Meal> = Vec::new();
    for item in &plan.plan {
        let day = item.id;
        let name = item.meal_name.trim();
        let side = item
            .side_dish
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        if let Some(side) = side {
            if !sides.contains(side) {
                out.push(Violation::UnknownSideDish {
                    day,
                    side_dish: side.to_string(),
                });
            }
        }

        let Some(&meal) = catalogue.get(name) else {
            out.push(Violation::UnknownMeal {
                day,
                meal: name.to_string(),
            });
            continue;
        };
        if banned.contains(name) {
            out.push(Violation::BannedMeal {
                day,
                meal: name.to_string(),
            });
        }
        if seen.insert(name) {
            planned.push(meal);
        } else {
            out.push(Violation::DuplicateMeal {
                day,
                meal: name.to_string(),
            });
        }

        match (meal.has_side_dish, side) {
            (true, None) if !sides.is_empty() => out.push(Violation::MissingSideDish {
                day,
                meal: name.to_string(),
            }),
            (false, Some(side)) => out.push(Violation::UnexpectedSideDish {
                day,
                meal: name.to_string(),
                side_dish: side.to_string(),
            }),
            _ => {}
        }
    }

    out.extend(shortfalls(&count_categories(planned), rules));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MealPlanItem;

    fn meal(name: &str, types: &[MealType], has_side_dish: bool) -> Meal {
        Meal {
            id: 0,
            name: name.to_string(),
            meal_types: types.to_vec(),
            notes: None,
            frequency_factor: 1.0,
            active_time: None,
            passive_time: None,
            has_side_dish,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn side(name: &str) -> SideDish {
        SideDish {
            id: 0,
            name: name.to_string(),
            notes: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn eaten(day: &str, meal: &str) -> HistoryEntry {
        HistoryEntry {
            id: 0,
            date_eaten: date(day),
            meal: meal.to_string(),
            side_dish: None,
        }
    }

    fn item(id: i64, meal: &str, side: Option<&str>) -> MealPlanItem {
        MealPlanItem {
            id,
            meal_name: meal.to_string(),
            meal_type: Vec::new(),
            side_dish: side.map(str::to_string),
            notes: None,
        }
    }

    fn catalogue() -> Vec<Meal> {
        vec![
            meal("Tacos", &[MealType::Meat], true),
            meal("Kanakeitto", &[MealType::Chicken, MealType::Vegetable], false),
            meal("Uunilohi", &[MealType::Fish], true),
            meal("Lihapullat", &[MealType::Meat], true),
        ]
    }

    fn three_day_rules() -> PlanRules {
        PlanRules {
            days: 3,
            ..PlanRules::default()
        }
    }

    #[test]
    fn test_banned_meals_window() {
        let history = vec![
            eaten("2024-03-08", "Tacos"),
            eaten("2024-02-20", "Uunilohi"),
            eaten("2024-02-24", "Kanakeitto"),
        ];
        let today = date("2024-03-09");

        let banned = banned_meals(&history, today, Some(14));
        assert!(banned.contains("Tacos"));
        assert!(banned.contains("Kanakeitto"));
        assert!(!banned.contains("Uunilohi"));

        let all = banned_meals(&history, today, None);
        assert_eq!(all.len(), 3);

        assert!(banned_meals(&history, today, Some(0)).is_empty());
        assert_eq!(banned_meals(&history, today, Some(i64::MAX)).len(), 3);
    }

    #[test]
    fn test_validate_bounds_recent_days() {
        let ok = PlanRules {
            recent_days: Some(MAX_RECENT_DAYS),
            ..PlanRules::default()
        };
        assert!(ok.validate().is_ok());
        for bad in [-1, MAX_RECENT_DAYS + 1, 100_000_000] {
            let rules = PlanRules {
                recent_days: Some(bad),
                ..PlanRules::default()
            };
            assert!(rules.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_window_start_saturates() {
        let today = date("2024-03-09");
        assert_eq!(window_start(today, 8), Some(date("2024-03-01")));
        assert_eq!(window_start(today, 4_000_000_000), None);
        assert_eq!(window_start(today, i64::MAX), None);
    }

    #[test]
    fn test_valid_plan_has_no_violations() {
        let plan = MealPlan {
            plan: vec![
                item(1, "Tacos", Some("Riisi")),
                item(2, "Kanakeitto", None),
                item(3, "Uunilohi", Some("Peruna")),
            ],
        };
        let violations = check_plan(
            &plan,
            &catalogue(),
            &[side("Riisi"), side("Peruna")],
            &BTreeSet::new(),
            &three_day_rules(),
        );
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn test_multi_type_meal_counts_for_every_category() {
        let plan = MealPlan {
            plan: vec![
                item(1, "Tacos", Some("Riisi")),
                item(2, "Kanakeitto", None),
                item(3, "Lihapullat", Some("Riisi")),
            ],
        };
        let violations = check_plan(
            &plan,
            &catalogue(),
            &[side("Riisi")],
            &BTreeSet::new(),
            &three_day_rules(),
        );
        assert_eq!(
            violations,
            vec![Violation::CategoryShortfall {
                category: MealType::Fish,
                required: 1,
                found: 0,
            }]
        );
    }

    #[test]
    fn test_check_plan_flags_each_problem() {
        let banned: BTreeSet<String> = ["Uunilohi".to_string()].into();
        let plan = MealPlan {
            plan: vec![
                item(1, "Pizza", None),
                item(2, "Uunilohi", Some("Riisi")),
                item(3, "Kanakeitto", Some("Riisi")),
                item(4, "Tacos", None),
                item(5, "Tacos", Some("Couscous")),
            ],
        };
        let violations = check_plan(
            &plan,
            &catalogue(),
            &[side("Riisi")],
            &banned,
            &three_day_rules(),
        );

        assert!(violations.contains(&Violation::WrongLength {
            expected: 3,
            found: 5
        }));
        assert!(violations.contains(&Violation::UnknownMeal {
            day: 1,
            meal: "Pizza".to_string()
        }));
        assert!(violations.contains(&Violation::BannedMeal {
            day: 2,
            meal: "Uunilohi".to_string()
        }));
        assert!(violations.contains(&Violation::UnexpectedSideDish {
            day: 3,
            meal: "Kanakeitto".to_string(),
            side_dish: "Riisi".to_string()
        }));
        assert!(violations.contains(&Violation::MissingSideDish {
            day: 4,
            meal: "Tacos".to_string()
        }));
        assert!(violations.contains(&Violation::DuplicateMeal {
            day: 5,
            meal: "Tacos".to_string()
        }));
        assert!(violations.contains(&Violation::UnknownSideDish {
            day: 5,
            side_dish: "Couscous".to_string()
        }));
    }

    #[test]
    fn test_categories_come_from_catalogue_not_model() {
        let mut lying = item(1, "Tacos", Some("Riisi"));
        lying.meal_type = vec![MealType::Fish];
        let rules = PlanRules {
            days: 1,
            min_per_category: [(MealType::Fish, 1)].into(),
            ..PlanRules::default()
        };
        let violations = check_plan(
            &MealPlan { plan: vec![lying] },
            &catalogue(),
            &[side("Riisi")],
            &BTreeSet::new(),
            &rules,
        );
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            Violation::CategoryShortfall {
                category: MealType::Fish,
                ..
            }
        ));
    }

    #[test]
    fn test_feasibility() {
        let banned: BTreeSet<String> = ["Uunilohi".to_string()].into();
        let violations = feasibility(&catalogue(), &banned, &three_day_rules());
        assert_eq!(
            violations,
            vec![Violation::CategoryShortfall {
                category: MealType::Fish,
                required: 1,
                found: 0,
            }]
        );

        let rules = PlanRules {
            days: 7,
            ..PlanRules::default()
        };
        let violations = feasibility(&catalogue(), &BTreeSet::new(), &rules);
        assert_eq!(
            violations,
            vec![Violation::WrongLength {
                expected: 7,
                found: 4
            }]
        );
    }

    #[test]
    fn test_rules_validate() {
        assert!(PlanRules::default().validate().is_ok());
        assert!(
            PlanRules {
                days: 0,
                ..PlanRules::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            PlanRules {
                days: 32,
                ..PlanRules::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            PlanRules {
                days: 2,
                min_per_category: [(MealType::Fish, 3)].into(),
                ..PlanRules::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_violation_serializes_with_kind_tag() {
        let json = serde_json::to_value(Violation::BannedMeal {
            day: 2,
            meal: "Tacos".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "banned_meal");
        assert_eq!(json["meal"], "Tacos");
    }
}
