pub mod chat;
pub mod config;
pub mod ingest;
pub mod persistence;
pub mod prompt;
pub mod server;
pub mod session;
pub mod spreadsheet;
pub mod workflow;
