pub mod credentials;
pub mod usage_log;
