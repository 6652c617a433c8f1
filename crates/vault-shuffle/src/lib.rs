pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod report;
pub mod retry;
pub mod sanitize;
pub mod verify;
pub mod workspace;

pub use error::{Error, Result};
