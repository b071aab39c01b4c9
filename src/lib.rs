//! coderun library
//!
//! Execution subsystem for a coding-exercise service:
//! - Admission control (rate limiting, duplicate suppression)
//! - Durable execution records with a forward-only status state machine
//! - At-least-once queue and bounded worker pool with retry supervision
//! - Docker-backed sandbox runner with strict resource/network limits

pub mod admission;
pub mod api;
pub mod config;
pub mod queue;
pub mod ratelimit;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod worker;
