pub mod accounts;
pub mod config;
pub mod constants;
pub mod egress;
pub mod fallback;
pub mod hardening;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod projections;
pub mod ratelimit;
pub mod sanitize;
pub mod signatures;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args, Settings};
