pub mod artifacts;
pub mod case;
pub mod checksum;
pub mod config;
pub mod converter;
pub mod descriptor;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod signature;
pub mod store;
pub mod validator;
