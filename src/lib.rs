pub mod config;
pub mod health;
pub mod ports;
pub mod proxy;
pub mod supervisor;
