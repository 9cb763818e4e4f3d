pub mod config;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod middleware;
pub mod models;
pub mod reporter;
pub mod repository;
pub mod services;
pub mod utils;
