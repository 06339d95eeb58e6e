pub mod api;
pub mod capture;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod health;
pub mod ingest;
pub mod pipeline;
pub mod pipeline_config;
pub mod prometheus;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod time;
