pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod mapping;
pub mod mqtt;
pub mod state;
pub mod supervisor;
pub mod validate;
