pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod region;
pub mod services;
pub mod storage;

pub use app::{router, AppState};
pub use config::AppConfig;
pub use error::RelayError;
