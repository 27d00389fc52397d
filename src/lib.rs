#[macro_use]
extern crate tracing;

pub mod alerts;
pub mod background;
pub mod builder;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod gafaelfawr;
pub mod http;
pub mod kubernetes;
pub mod models;
pub mod registry;
pub mod services;
pub mod timeout;
