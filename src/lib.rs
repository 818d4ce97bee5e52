pub mod app;
pub mod auth;
pub mod completions;
pub mod config;
pub mod error;
pub mod handlers;
pub mod invoker;
pub mod keys;
pub mod messages;
pub mod model_input;
pub mod model_registry;
pub mod tokens;
pub mod upstream;
