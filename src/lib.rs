pub mod compose;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod handler;
pub mod image;
pub mod logging;
pub mod project;
pub mod stack;
pub mod ui;
