pub mod cli;
pub mod config;
pub mod core;
pub mod db;
pub mod engine;
pub mod error;
pub mod exit;
pub mod inventory;
pub mod logs;
pub mod platform;
pub mod runtime;
pub mod scanner;
pub mod summary;
pub mod ui;
