//! Resumable, browser-driven page analysis workflows.
//!
//! A [`workflow::WorkflowEngine`] walks a list of page URLs one at a time,
//! loading each in a session from a [`browser::BrowserSessionPool`] and
//! handing it to a [`analyzer::PageAnalyzer`]. Progress is checkpointed to
//! the project directory so an interrupted run can be resumed.

pub mod analyzer;
pub mod browser;
pub mod cli;
pub mod error;
pub mod storage;
pub mod utils;
pub mod workflow;
