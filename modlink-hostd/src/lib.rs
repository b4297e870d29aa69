//! Host daemon internals: in-process broker bus, Route registry, config.

pub mod bus;
pub mod config;
pub mod registry;
