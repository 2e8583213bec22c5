#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod logging;
pub mod security;
pub mod store;
pub mod youtube;
