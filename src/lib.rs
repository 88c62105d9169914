//! topfast - per-command CPU accounting that does not miss short-lived processes
//!
//! Kernel exit events give the exact lifetime CPU of every process, however
//! briefly it ran; a periodic scan charges long-lived processes as they run.
//! Usage is aggregated per command name, both for the command itself and for
//! the whole subtree of processes it spawned.

pub mod cli;
pub mod config;
pub mod engine;
pub mod host;
pub mod report;
pub mod service;
pub mod signals;
pub mod source;
