//! Tag-indexed, multi-strategy response cache and its operator service.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
