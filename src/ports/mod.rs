//! Port traits at the boundaries of the domain.

pub mod broker_port;
pub mod config_port;
pub mod data_port;
