pub mod apps;
pub mod blocklist;
pub mod config;
pub mod daemon;
pub mod helpers;
pub mod unlock;
