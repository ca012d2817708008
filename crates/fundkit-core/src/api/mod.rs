//! REST client module for the hosted backend.
//!
//! This module provides `SupabaseClient` for signing in and for reading and
//! writing kit rows and images. It implements the `RowStore` and
//! `ObjectStorage` contracts so the kit service can run against it directly.
//!
//! Requests carry the project API key plus a bearer token: the session token
//! once signed in, the API key itself otherwise.

pub mod client;
pub mod error;

pub use client::SupabaseClient;
pub use error::ApiError;
