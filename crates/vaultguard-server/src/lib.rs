pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod middleware;
pub mod plan_limits;
pub mod service;

#[cfg(test)]
mod test_support;
