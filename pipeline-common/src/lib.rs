pub mod bootstrap;
pub mod config;
pub mod event;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod time;
