pub mod accounting;
pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod normalize;
pub mod pricing;
pub mod rate_limit;
pub mod relay;
pub mod store;
pub mod upstream;
pub mod users;
