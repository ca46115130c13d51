// Library exports for the fleetwarden supervisor

pub mod adapter;
pub mod bus;
pub mod config;
pub mod error;
pub mod process;
pub mod stream;
pub mod watchdog;
