//! Prospecta Lead-Generation API Library
//!
//! This library provides the core functionality for the Prospecta platform:
//! lead discovery (geo, registry, competitor, buyer-intent scans), per-lead
//! enrichment, credit metering, white-label branding, and the outbound
//! vendor gateway.
//!
//! # Modules
//!
//! - `branding`: White-label branding resolution with fallback.
//! - `circuit_breaker`: Circuit breaker for the public registry endpoints.
//! - `config`: Configuration management.
//! - `credits`: Pre-flight credit gate and cost constants.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Tenant-scoped persistence operations.
//! - `discovery`: Geo/registry scan strategies and the continuous scan loop.
//! - `enrichment`: Per-lead enrichment workflow.
//! - `errors`: Error handling types.
//! - `gateway`: Outbound vendor API broker (cache, retry, routing, usage).
//! - `handlers`: HTTP request handlers.
//! - `hunters`: Competitor-mention and buyer-intent scans.
//! - `models`: Core data models.
//! - `payments`: Hosted checkout session creation.
//! - `rate_limit`: Outbound politeness rate limiter.
//! - `registry`: CNPJ utilities and the multi-endpoint registry resolver.
//! - `webhooks`: Fire-and-forget outbound webhook dispatch.

pub mod branding;
pub mod circuit_breaker;
pub mod config;
pub mod credits;
pub mod db;
pub mod db_storage;
pub mod discovery;
pub mod enrichment;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod hunters;
pub mod models;
pub mod payments;
pub mod rate_limit;
pub mod registry;
pub mod webhooks;
