//! Thawgate - freezes idle containers and thaws them on demand
//!
//! This library provides an admission gate in front of containerized services:
//! - Discovers opted-in containers from their runtime labels
//! - Freezes (stops or pauses) each container after its idle timeout
//! - Thaws frozen containers when a client asks for them
//! - Admits a request only once every container it needs is online
//! - Serves a "please wait" page that polls until admission

pub mod config;
pub mod container;
pub mod docker;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod pages;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod timer;
