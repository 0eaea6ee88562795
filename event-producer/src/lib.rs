pub mod config;
pub mod error;
pub mod generator;
pub mod producer;
pub mod publisher;
