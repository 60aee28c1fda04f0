pub mod backend;
pub mod config;
pub mod health;
pub mod shutdown;
