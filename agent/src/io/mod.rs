//! Side-effecting collaborators of the agent loop.

pub mod approval;
pub mod audit;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod lock;
pub mod planner;
pub mod process;
pub mod prompt;
pub mod session;
