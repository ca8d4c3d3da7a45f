//! Foreman - run a pool of coding-agent workers against a task tracker
//!
//! Each worker slot owns a git worktree, claims one ready task at a time,
//! runs the agent CLI on it and reconciles what the run left behind.

pub mod claims;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod scheduler;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod tracker;
pub mod workspace;
