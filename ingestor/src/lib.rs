pub mod assembler;
pub mod config;
pub mod counters;
pub mod errors;
pub mod history;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod queries;
pub mod rest;
pub mod retry;
pub mod router;
pub mod store;
pub mod validate;
