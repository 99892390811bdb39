//! Core crate for sketchsplit: job lifecycle, pipeline stages and the HTTP surface.

pub mod bundle;
pub mod compose;
pub mod config;
pub mod edges;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod storage;
pub mod stylize;
pub mod worker;
