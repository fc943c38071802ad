//! Tollgate - Request Admission Engine
//!
//! This crate implements policy-driven, identity-keyed, fixed-window rate
//! limiting for web applications. Route handlers consume it through the
//! [`admission::Admission`] adapter; operational tooling can query quota state
//! without consuming it. Counters live in process or, for multi-instance
//! deployments, are shared over a gossip mesh.

pub mod admission;
pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
