//! Client library for the Actions backend.
//!
//! This crate owns everything the dispatcher needs to talk to the hosted CI
//! service:
//!
//! - The GitHub App credential flow (app JWT → installation token → runner
//!   registration token → Actions-service admin token) and automatic admin
//!   token refresh.
//! - Typed endpoints for runner scale sets, message sessions, JIT runner
//!   configs, runner records, and acquirable jobs.
//! - The message-queue protocol (long-poll receive, ordered delete, acquire)
//!   with its token-expired signalling.
//!
//! # Invariants
//!
//! - Every admin-token request checks the 60-second refresh window first;
//!   concurrent refreshers coalesce behind a mutex.
//! - Transport errors and 5xx responses are retried with bounded exponential
//!   backoff before surfacing; 4xx responses are never retried here.

pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
mod http;
mod queue;
pub mod types;

pub use client::{ActionsApi, ActionsClient, ActionsSettings};
pub use config::{GitHubConfig, GitHubScope};
pub use error::ActionsError;
