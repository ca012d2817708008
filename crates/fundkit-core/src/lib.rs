//! Fundraising kit storage and reconciliation.
//!
//! A kit is a microsite made of header images and an ordered list of typed
//! sections holding ordered items. This crate saves edited kits by diffing
//! them against what is stored, so only changed rows are written:
//!
//! - `reconcile`: pure diff of previous vs. next sections and items
//! - `service`: `KitService`, the create/get/update/delete aggregate API
//! - `assets`: image uploads attached to header and item fields
//! - `store`: backend contracts plus in-memory implementations
//! - `api`: REST client for the hosted backend
//! - `auth`, `config`: session, keychain and settings for the CLI

pub mod api;
pub mod assets;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod utils;

pub use assets::{AssetResolver, AssetSlot};
pub use config::Config;
pub use error::{KitError, Result};
pub use models::{Fundraiser, Item, Kit, Section, SectionType};
pub use service::KitService;
