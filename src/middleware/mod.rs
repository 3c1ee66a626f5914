//! Middleware for the gateway's administrative surface

pub mod auth;
