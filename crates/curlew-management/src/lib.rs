// crates/curlew-management/src/lib.rs
// ============================================================================
// Module: Curlew Management Library
// Description: Client for the platform management service.
// Purpose: Registry, categories, asset tracking, audit, and tokens.
// Dependencies: curlew-core, reqwest, serde, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! The management service is an external collaborator; this crate holds the
//! blocking client the readings service uses to register itself, follow
//! configuration categories, announce tracked assets, file audit entries,
//! and verify peer bearer tokens. All failures surface as
//! [`curlew_core::ManagementError`] values that callers log and retry;
//! the data path never blocks on this surface.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod client;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use client::ManagementClient;
pub use client::ManagementClientConfig;
pub use client::ServiceRecord;
pub use client::TokenClaims;
