pub mod client;
pub mod config;
pub mod directory;
pub mod errors;
pub mod extender;
pub mod fanout;
pub mod forward;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod rest;
