pub mod automation;
pub mod config;
pub mod kv;
pub mod logging;
