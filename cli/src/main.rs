mod commands;
mod config;
mod llm;
mod logging;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use crate::commands::{
    PlanArgs, cmd_backup_create, cmd_backup_list, cmd_backup_restore, cmd_backup_truncate,
    cmd_backup_verify, cmd_history_list, cmd_history_log, cmd_history_remove, cmd_install,
    cmd_meal_add, cmd_meal_list, cmd_meal_remove, cmd_meal_show, cmd_migrate, cmd_plan, cmd_seed,
    cmd_side_add, cmd_side_list, cmd_side_remove,
};
use crate::config::Config;
use crate::llm::{ChatClient, Provider};
use mealplan_core::db::Database;
use mealplan_core::rules::{DEFAULT_PLAN_DAYS, DEFAULT_RECENT_DAYS, PlanRules};

#[derive(Parser)]
#[command(
    name = "mealplan",
    version,
    about = "Plan weekly dinners from your own meal catalogue",
    long_about = "Keeps a catalogue of dinners, side dishes and what you ate, and asks a \
                  language model for a dinner plan that skips recently eaten meals."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "APP_PORT", default_value = "8000")]
        port: u16,
        /// Address to bind to (use 0.0.0.0 to expose to network)
        #[arg(short, long, env = "APP_HOST", default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
        /// LLM provider used for /api/plan (default: MEALPLAN_LLM_PROVIDER or mistral)
        #[arg(long, value_enum)]
        provider: Option<Provider>,
        /// Model name (default: MEALPLAN_LLM_MODEL or the provider default)
        #[arg(long)]
        model: Option<String>,
    },
    /// Create the schema, back up and clear existing data, and load the seed catalogue
    Install {
        /// Directory of NNN_name.sql migrations (default: built-in)
        #[arg(long, value_name = "DIR")]
        migrations_dir: Option<PathBuf>,
        /// Directory holding seed_meals.json and seed_sidedishes.json (default: built-in)
        #[arg(long, value_name = "DIR")]
        seed_dir: Option<PathBuf>,
        /// Skip the backup of existing data
        #[arg(long)]
        no_backup: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply or roll back schema migrations
    Migrate {
        /// Directory of NNN_name.sql migrations (default: built-in)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Target version; lower than the current version rolls back
        #[arg(long)]
        to: Option<i64>,
        /// Show applied and pending migrations instead
        #[arg(long)]
        status: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Insert seed meals and side dishes that are not present yet
    Seed {
        /// Directory holding seed_meals.json and seed_sidedishes.json (default: built-in)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create, inspect and restore backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Manage meals
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Manage side dishes
    Side {
        #[command(subcommand)]
        command: SideCommands,
    },
    /// Record and review eaten meals
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
    /// Generate a dinner plan
    Plan {
        /// Number of days to plan
        #[arg(short, long, default_value_t = DEFAULT_PLAN_DAYS)]
        days: usize,
        /// Skip meals eaten within this many days
        #[arg(long, default_value_t = DEFAULT_RECENT_DAYS)]
        recent_days: i64,
        /// Skip every meal in the history, however old
        #[arg(long, conflicts_with = "recent_days")]
        all_history: bool,
        /// LLM provider (default: MEALPLAN_LLM_PROVIDER or mistral)
        #[arg(long, value_enum)]
        provider: Option<Provider>,
        /// Model name (default: MEALPLAN_LLM_MODEL or the provider default)
        #[arg(long)]
        model: Option<String>,
        /// Print the system prompt without calling the model
        #[arg(long)]
        prompt_only: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Write a backup of every table
    Create {
        /// Compact JSON without indentation
        #[arg(long)]
        minimize: bool,
        /// Write plain JSON instead of gzip
        #[arg(long)]
        no_gzip: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List backups, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a backup against its checksum file
    Verify {
        /// Backup file (path, or name inside the backup directory)
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace all data with the contents of a backup
    Restore {
        /// Backup file (path, or name inside the backup directory)
        file: PathBuf,
        /// Skip the backup of current data
        #[arg(long)]
        no_backup: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Back up, then delete every row
    Truncate {
        /// Delete without backing up first
        #[arg(long)]
        no_backup: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MealCommands {
    /// Add a meal
    Add {
        /// Meal name
        name: String,
        /// Comma-separated types: meat, chicken, fish, vegetable
        #[arg(short, long)]
        types: String,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// Relative frequency weight
        #[arg(long, default_value = "1.0")]
        frequency: f64,
        /// Preparation time in minutes
        #[arg(long)]
        active_time: Option<i64>,
        /// Cooking time in minutes
        #[arg(long)]
        passive_time: Option<i64>,
        /// The meal is complete without a side dish
        #[arg(long)]
        no_side_dish: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List meals
    List {
        /// Only meals of this type
        #[arg(short = 't', long = "type")]
        meal_type: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one meal
    Show {
        /// Meal name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a meal and its history
    Remove {
        /// Meal name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SideCommands {
    /// Add a side dish
    Add {
        /// Side dish name
        name: String,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List side dishes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a side dish
    Remove {
        /// Side dish name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Record an eaten meal
    Log {
        /// Meal name (must already exist)
        meal: String,
        /// Side dish served with it (must already exist, see `mealplan side add`)
        #[arg(short, long)]
        side: Option<String>,
        /// Date eaten (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List eaten meals, newest first
    List {
        /// Only the last N days (default: all)
        #[arg(short, long)]
        days: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a history entry by ID
    Remove {
        /// History entry ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    logging::init(&config.log_level);

    // These manage the schema themselves.
    match &cli.command {
        Commands::Install {
            migrations_dir,
            seed_dir,
            no_backup,
            json,
        } => {
            return cmd_install(
                &config.db_path,
                config.ensure_backup_dir()?,
                migrations_dir.as_deref(),
                seed_dir.as_deref(),
                *no_backup,
                *json,
            );
        }
        Commands::Migrate {
            dir,
            to,
            status,
            json,
        } => return cmd_migrate(&config.db_path, dir.as_deref(), *to, *status, *json),
        _ => {}
    }

    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Install { .. } | Commands::Migrate { .. } => Ok(()),
        Commands::Serve {
            port,
            bind,
            no_auth,
            provider,
            model,
        } => {
            let (api_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            let planner = Arc::new(ChatClient::from_settings(&config.llm, provider, model));
            server::start_server(
                db,
                planner,
                PlanRules::default(),
                port,
                &bind,
                api_key,
                new_api_key,
            )
            .await
        }
        Commands::Seed { dir, json } => cmd_seed(&db, dir.as_deref(), json),
        Commands::Backup { command } => {
            let dir = config.ensure_backup_dir()?;
            match command {
                BackupCommands::Create {
                    minimize,
                    no_gzip,
                    json,
                } => cmd_backup_create(&db, dir, minimize, no_gzip, json),
                BackupCommands::List { json } => cmd_backup_list(dir, json),
                BackupCommands::Verify { file, json } => cmd_backup_verify(dir, &file, json),
                BackupCommands::Restore {
                    file,
                    no_backup,
                    json,
                } => cmd_backup_restore(&db, dir, &file, no_backup, json),
                BackupCommands::Truncate { no_backup, json } => {
                    cmd_backup_truncate(&db, dir, no_backup, json)
                }
            }
        }
        Commands::Meal { command } => match command {
            MealCommands::Add {
                name,
                types,
                notes,
                frequency,
                active_time,
                passive_time,
                no_side_dish,
                json,
            } => cmd_meal_add(
                &db,
                &name,
                &types,
                notes,
                frequency,
                active_time,
                passive_time,
                no_side_dish,
                json,
            ),
            MealCommands::List { meal_type, json } => {
                cmd_meal_list(&db, meal_type.as_deref(), json)
            }
            MealCommands::Show { name, json } => cmd_meal_show(&db, &name, json),
            MealCommands::Remove { name, json } => cmd_meal_remove(&db, &name, json),
        },
        Commands::Side { command } => match command {
            SideCommands::Add { name, notes, json } => cmd_side_add(&db, &name, notes, json),
            SideCommands::List { json } => cmd_side_list(&db, json),
            SideCommands::Remove { name, json } => cmd_side_remove(&db, &name, json),
        },
        Commands::History { command } => match command {
            HistoryCommands::Log {
                meal,
                side,
                date,
                json,
            } => cmd_history_log(&db, &meal, side, date, json),
            HistoryCommands::List { days, json } => cmd_history_list(&db, days, json),
            HistoryCommands::Remove { id, json } => cmd_history_remove(&db, id, json),
        },
        Commands::Plan {
            days,
            recent_days,
            all_history,
            provider,
            model,
            prompt_only,
            json,
        } => {
            cmd_plan(
                &db,
                &config.llm,
                PlanArgs {
                    days,
                    recent_days,
                    all_history,
                    provider,
                    model,
                    prompt_only,
                    json,
                },
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_history_log_help_says_names_must_exist() {
        let mut cli = Cli::command();
        let log = cli
            .find_subcommand_mut("history")
            .unwrap()
            .find_subcommand_mut("log")
            .unwrap();
        let help = log.render_long_help().to_string();
        assert!(help.contains("see `mealplan side add`"));
    }
}
