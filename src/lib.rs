//! Stagehand - embeddable handler dispatch engine
//!
//! Core library: handler lifecycle, interceptor pipelines, the dispatch
//! engine and the embedding facade.

pub mod clock;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod server;
pub mod servlet;
