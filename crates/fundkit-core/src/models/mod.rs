//! Data models for fundraising kits.
//!
//! - `Kit`: the authored page with header images and ordered sections
//! - `Section`, `SectionType`: typed, positioned groups of content
//! - `Item`: positioned entries inside a section
//! - `Fundraiser`: campaign a kit can be assigned to
//!
//! Validation predicates live next to the types so the service and any
//! caller can apply the same rules.

pub mod fundraiser;
pub mod kit;

pub use fundraiser::Fundraiser;
pub use kit::{is_valid_kit, is_valid_section, normalize_fundraiser_ref, Item, Kit, Section, SectionType};
