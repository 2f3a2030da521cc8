pub mod analytics_batcher;
pub mod config;
pub mod host;
pub mod ingest_client;
