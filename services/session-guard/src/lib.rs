//! Distributed session and token revocation
//!
//! Stateless service instances share one [`common::StateStore`]. Sessions,
//! blacklisted tokens and refresh rotation all live there, so a revocation
//! made through any instance is enforced by every other instance on the
//! next request.

pub mod activity;
pub mod audit;
pub mod blacklist;
pub mod config;
pub mod decision;
pub mod error;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod rotation;
pub mod routes;
pub mod service;
pub mod session;

mod deadline;

pub use config::GuardConfig;
pub use decision::{AuthDecision, DenyReason, RequestCredentials};
pub use error::{GuardError, GuardResult};
pub use service::SessionService;
