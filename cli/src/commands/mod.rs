mod admin;
mod backup;
mod helpers;
mod history;
mod meal;
mod plan;

pub(crate) use admin::{cmd_install, cmd_migrate, cmd_seed};
pub(crate) use backup::{
    cmd_backup_create, cmd_backup_list, cmd_backup_restore, cmd_backup_truncate,
    cmd_backup_verify,
};
pub(crate) use history::{cmd_history_list, cmd_history_log, cmd_history_remove};
pub(crate) use meal::{
    cmd_meal_add, cmd_meal_list, cmd_meal_remove, cmd_meal_show, cmd_side_add, cmd_side_list,
    cmd_side_remove,
};
pub(crate) use plan::{PlanArgs, cmd_plan};
