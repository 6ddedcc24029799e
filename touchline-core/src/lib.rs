#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod controllers;
pub mod counters;
pub mod entities;
pub mod events;
pub mod framework;
pub mod presence;
pub mod processors;
pub mod provider;
pub mod streaming;
