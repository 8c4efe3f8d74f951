use std::collections::BTreeSet;

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{HistoryEntry, Meal, MealPlan, SideDish};
use crate::prompt::{PromptInput, system_prompt};
use crate::rules::{self, PlanRules, Violation};

/// Everything a plan is built and judged against, read once from the
/// database.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub today: NaiveDate,
    pub rules: PlanRules,
    pub meals: Vec<Meal>,
    pub side_dishes: Vec<SideDish>,
    pub history: Vec<HistoryEntry>,
    pub banned: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan: MealPlan,
    pub violations: Vec<Violation>,
    pub valid: bool,
}

impl PlanContext {
    pub fn load(db: &Database, today: NaiveDate, rules: PlanRules) -> Result<Self> {
        rules.validate()?;
        let since = rules
            .recent_days
            .and_then(|days| rules::window_start(today, days));
        let history = db.list_history(since)?;
        let banned = rules::banned_meals(&history, today, rules.recent_days);
        let meals = db.list_meals()?;
        let side_dishes = db.list_side_dishes()?;
        debug!(
            meals = meals.len(),
            side_dishes = side_dishes.len(),
            banned = banned.len(),
            "Loaded plan context"
        );
        Ok(Self {
            today,
            rules,
            meals,
            side_dishes,
            history,
            banned,
        })
    }

    #[must_use]
    pub fn prompt(&self) -> String {
        system_prompt(&PromptInput {
            today: self.today,
            rules: &self.rules,
            banned: &self.banned,
            meals: &self.meals,
            side_dishes: &self.side_dishes,
        })
    }

    /// Quotas the current catalogue cannot satisfy once banned meals are
    /// removed.
    #[must_use]
    pub fn shortfalls(&self) -> Vec<Violation> {
        rules::feasibility(&self.meals, &self.banned, &self.rules)
    }

    #[must_use]
    pub fn review(&self, plan: MealPlan) -> PlanReport {
        let violations = rules::check_plan(
            &plan,
            &self.meals,
            &self.side_dishes,
            &self.banned,
            &self.rules,
        );
        for v in &violations {
            warn!(violation = %v, "Plan breaks a rule");
        }
        PlanReport {
            valid: violations.is_empty(),
            plan,
            violations,
        }
    }
}
