//! Tollbooth - withering-token reverse proxy for OpenAI-compatible LLM APIs
//!
//! The proxy fronts a multi-tenant API: each project owns an upstream API
//! key, and end users hold short-lived withering tokens scoped to one
//! project. Per request the pipeline validates the token, enforces rate
//! limits and project activation, rewrites the Authorization header to the
//! project's upstream key, forwards, streams the response back unmodified
//! (caching it when permitted), and emits an observability event.

pub mod admin;
pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod proxy;
pub mod ratelimit;
pub mod stats;
pub mod store;
pub mod util;
