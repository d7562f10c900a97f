//! The amesh agent and directory control tool.
//!
//! `ameshd` advertises this host's tunnel identity into the directory
//! under a renewable lease, watches the directory for the other mesh
//! members, and continuously reconciles local kernel state with the
//! desired peer and route set. `amesh-control` seeds the same directory
//! from configuration files.

pub mod agent;
pub mod config;
pub mod control;
pub mod error;
