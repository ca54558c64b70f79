pub mod banner;
pub mod cache;
pub mod checker;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod metrics;
pub mod notworkers;
pub mod parser;
pub mod pool;
pub mod port_pool;
pub mod prober;
pub mod ranker;
pub mod relay;
pub mod relay_config;
pub mod speedtest;
