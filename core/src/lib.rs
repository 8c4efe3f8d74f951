pub mod backup;
pub mod db;
pub mod digest;
pub mod migrations;
pub mod models;
pub mod planner;
pub mod prompt;
pub mod rules;
pub mod seed;
