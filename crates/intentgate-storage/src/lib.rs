pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod store;

pub use db::Database;
pub use error::{Result, StoreError};
pub use models::{
    keys, ExemptionSnapshot, Settings, DEFAULT_CHALLENGE_SENTENCE, DEFAULT_EXEMPTION_DURATION_MS,
    MAX_EXEMPTION_MS,
};
pub use store::ConfigStore;
