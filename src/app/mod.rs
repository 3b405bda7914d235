pub mod adb;
pub mod config;
pub mod error;
pub mod flash;
pub mod logging;
pub mod models;
pub mod platform;
pub mod progress;
pub mod staging;
