pub mod config;
pub mod error;
pub mod notification;
pub mod routes;
