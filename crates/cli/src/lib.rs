pub mod bridge;
pub mod cli;
pub mod error;
pub mod services;
pub mod signals;
pub mod stacks;
