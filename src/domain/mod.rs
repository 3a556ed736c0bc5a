//! Core domain types and logic.

pub mod bar;
pub mod opening_range;
pub mod position;
pub mod params;
pub mod strategy;
pub mod data_feed;
pub mod backtest;
pub mod metrics;
pub mod request;
pub mod config_validation;
pub mod error;
