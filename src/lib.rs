pub mod agent;
pub mod config;
pub mod error;
pub mod host;
pub mod job;
pub mod script;
pub mod service;
pub mod shutdown;
pub mod wire;
