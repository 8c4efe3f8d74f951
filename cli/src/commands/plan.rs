use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use tabled::{Table, Tabled, settings::Style};

use crate::config::LlmSettings;
use crate::llm::{ChatClient, PlanProvider, Provider};
use mealplan_core::db::Database;
use mealplan_core::planner::{PlanContext, PlanReport};
use mealplan_core::rules::PlanRules;

use super::helpers::{format_types, print_json, truncate};

pub(crate) struct PlanArgs {
    pub days: usize,
    pub recent_days: i64,
    pub all_history: bool,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub prompt_only: bool,
    pub json: bool,
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    provider: Provider,
    model: &'a str,
    #[serde(flatten)]
    report: &'a PlanReport,
}

pub(crate) async fn cmd_plan(db: &Database, llm: &LlmSettings, args: PlanArgs) -> Result<()> {
    let rules = PlanRules {
        days: args.days,
        recent_days: (!args.all_history).then_some(args.recent_days),
        ..PlanRules::default()
    };
    let ctx = PlanContext::load(db, Local::now().date_naive(), rules)?;

    if args.prompt_only {
        println!("{}", ctx.prompt());
        return Ok(());
    }

    for shortfall in ctx.shortfalls() {
        eprintln!("Warning: {shortfall}");
    }

    let client = ChatClient::from_settings(llm, args.provider, args.model);
    if !args.json {
        eprintln!(
            "Asking {} ({}) for a {}-day plan...",
            client.provider(),
            client.model(),
            ctx.rules.days
        );
    }
    let plan = client.generate(&ctx.prompt()).await?;
    let report = ctx.review(plan);

    if args.json {
        return print_json(&PlanOutput {
            provider: client.provider(),
            model: client.model(),
            report: &report,
        });
    }

    print_plan_table(&report);
    if report.valid {
        println!("Plan follows every rule.");
    } else {
        println!("Plan breaks {} rule(s):", report.violations.len());
        for violation in &report.violations {
            println!("  - {violation}");
        }
    }
    Ok(())
}

fn print_plan_table(report: &PlanReport) {
    #[derive(Tabled)]
    struct PlanRow {
        #[tabled(rename = "Day")]
        day: i64,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Types")]
        types: String,
        #[tabled(rename = "Side dish")]
        side_dish: String,
        #[tabled(rename = "Notes")]
        notes: String,
    }

    let rows: Vec<PlanRow> = report
        .plan
        .plan
        .iter()
        .map(|item| PlanRow {
            day: item.id,
            meal: truncate(&item.meal_name, 35),
            types: format_types(&item.meal_type),
            side_dish: item.side_dish.clone().unwrap_or_else(|| "-".into()),
            notes: item
                .notes
                .as_deref()
                .map(|n| truncate(n, 40))
                .unwrap_or_default(),
        })
        .collect();

    println!("{}", Table::new(&rows).with(Style::rounded()));
}
