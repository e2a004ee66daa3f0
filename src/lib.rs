//! Local-first tracker of application activity and work sessions.
//! A small daemon samples the foreground window, folds the samples into activity spans grouped
//! into sessions, and answers a cli over a Unix socket.
//!

pub mod cli;
pub mod control;
pub mod daemon;
pub mod error;
pub mod utils;
pub mod window_api;
