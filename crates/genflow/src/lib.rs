//! Asynchronous job execution for long-running media tools.
//!
//! A [`jobs::Scheduler`] accepts work descriptors, turns them into
//! subprocess invocations through registered planners, runs them on a bounded
//! pool of execution slots and keeps a durable JSON record per job in a
//! [`jobs::StatusStore`]. [`api::router`] exposes submit and status over HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
