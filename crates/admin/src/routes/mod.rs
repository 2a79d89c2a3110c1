pub mod analytics;
pub mod client;
pub mod config;
pub mod health;
pub mod metrics;
pub mod quota;
pub mod usage;
