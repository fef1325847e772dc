pub mod config;
pub mod types;

pub use config::Configuration;
pub use types::Settings;
