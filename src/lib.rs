pub mod auth;
pub mod codec;
pub mod config;
pub mod health;
pub mod hub;
pub mod intents;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod persistence;
pub mod session;
pub mod upgrade;
