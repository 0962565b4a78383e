pub mod backfill;
pub mod cache;
pub mod care_request;
pub mod clients;
pub mod config;
pub mod errors;
pub mod logging;
pub mod matching;
pub mod reconcile;
pub mod server;
pub mod service;
pub mod store;
