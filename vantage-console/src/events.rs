//! Event types for the console event loop.

use vantage_cache::CacheEvent;

use crate::state::SettledWrite;

#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    /// One line typed by the user.
    Input(String),
    /// A write batch landed in the query cache.
    Cache(CacheEvent),
    /// The server answered a write issued earlier.
    WriteSettled(SettledWrite),
    InputClosed,
}
