pub mod access;
pub mod aggregator;
pub mod cascade;
pub mod config;
pub mod documents;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod schema;
pub mod store;
pub mod writer;
