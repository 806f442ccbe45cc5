// session-gate - Library root for testing

pub mod auth;
pub mod callback;
pub mod config;
pub mod error;
pub mod http_client;
pub mod models;
pub mod navigation;
