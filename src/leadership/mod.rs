// Leadership over named services
//
// A `Manager` answers claim, check and block requests for any number of
// services. Each service is led by at most one holder at a time, for as long
// as that holder keeps its lease alive in the store.

pub mod config;
mod control;
pub mod manager;
mod state;
pub mod token;

pub use config::{ManagerConfig, Tuning};
pub use manager::Manager;
pub use token::Token;
