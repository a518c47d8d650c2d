//! Vantage console library exports.

pub mod api_client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod mutations;
pub mod nav;
pub mod notifications;
pub mod persistence;
pub mod queries;
pub mod selection;
pub mod state;
pub mod telemetry;
pub mod traits;
pub mod views;
