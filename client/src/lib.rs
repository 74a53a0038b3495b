pub mod actions;
pub mod app;
pub mod attachments;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod ledger;
pub mod orchestrator;
pub mod roles;
pub mod session;
pub mod testutils;
pub mod units;
pub mod validation;

pub use error::{ClientError, Result};
