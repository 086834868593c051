//! Library of the beem chat relay bot.

pub mod chat_command;
pub mod chat_source;
pub mod configuration;
pub mod errors;
pub mod orchestrator;
pub mod query_router;
pub mod telemetry;
pub mod tv;
pub mod user_store;
pub mod wt;
