//! Provisioning and lifecycle management for a Story node pair: the `story`
//! consensus client and the `geth` execution client.
//!
//! Each CLI action maps to one step of [`steps::StepKind`] (or the fixed
//! `full_install` sequence). Steps describe their work as [`command`] data and
//! run it through a [`host::Host`], which lets the whole catalog be exercised
//! against a recording host in tests and printed with `--dry-run`.

pub mod cli;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod host;
pub mod patch;
pub mod runner;
pub mod service;
pub mod steps;
pub mod units;
