//! Resumable file transfer broker.
//!
//! Clients connect over WebSocket and drive two workflows: chunked uploads
//! staged to local disk and handed off to a downstream HTTP store, and URL
//! downloads with Range-based resume. Sessions survive client disconnects.

pub mod catalog;
pub mod common;
pub mod download;
pub mod protocol;
pub mod server;
pub mod upload;
pub mod utils;
