pub mod config;
pub mod console;
pub mod content_loader;
pub mod progress_log;
