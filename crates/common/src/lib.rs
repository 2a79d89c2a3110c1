//! Shared configuration and error types for the quotaguard workspace.

pub mod config;
pub mod error;

pub use config::{
    AdminConfig, AppConfig, QuotaConfig, ServerConfig, StorageBackend, StorageConfig,
    WindowConfig, WindowName,
};
pub use error::{QuotaError, QuotaResult};
