use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel the authoring form sends for "no fundraiser assigned".
const NO_FUNDRAISER_SENTINEL: &str = "none";

/// Closed set of section kinds a kit page knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SectionType {
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "whatToDo", alias = "steps")]
    WhatToDo,
    #[serde(rename = "whatsapp")]
    Whatsapp,
    #[serde(rename = "links")]
    Links,
    #[serde(rename = "social")]
    Social,
    #[serde(rename = "info")]
    Info,
}

impl SectionType {
    pub const ALL: [SectionType; 6] = [
        SectionType::Video,
        SectionType::WhatToDo,
        SectionType::Whatsapp,
        SectionType::Links,
        SectionType::Social,
        SectionType::Info,
    ];

    /// Name used in storage rows and JSON payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionType::Video => "video",
            SectionType::WhatToDo => "whatToDo",
            SectionType::Whatsapp => "whatsapp",
            SectionType::Links => "links",
            SectionType::Social => "social",
            SectionType::Info => "info",
        }
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(SectionType::Video),
            "whatToDo" | "steps" => Ok(SectionType::WhatToDo),
            "whatsapp" => Ok(SectionType::Whatsapp),
            "links" => Ok(SectionType::Links),
            "social" => Ok(SectionType::Social),
            "info" => Ok(SectionType::Info),
            other => Err(format!("unknown section type: {}", other)),
        }
    }
}

/// A positioned content entry inside a section.
///
/// Which optional fields are meaningful depends on the parent section's type:
/// WhatsApp templates use `content`, video sections use `video_url`, link and
/// social sections use `link_url`/`link_text` and `image_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Item {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub link_url: Option<String>,
    #[serde(default)]
    pub link_text: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Item {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// A typed, positioned group of items on a kit page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Section {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub section_type: SectionType,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Section {
    pub fn new(name: impl Into<String>, section_type: SectionType) -> Self {
        Self {
            id: None,
            kit_id: None,
            name: name.into(),
            description: None,
            section_type,
            position: 0,
            items: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<Item>) -> Self {
        self.items = items;
        self
    }
}

/// A fundraising kit together with its ordered sections.
///
/// The same shape is used for authoring input and for the aggregate returned by
/// reads; identities and timestamps are only populated on persisted values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Kit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fundraiser_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub header_desktop_image: Option<String>,
    #[serde(default)]
    pub header_mobile_image: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Kit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }
}

fn is_present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// A section is storable when its position is non-negative. The type is
/// checked by construction since `SectionType` is a closed enum.
pub fn is_valid_section(section: &Section) -> bool {
    SectionType::ALL.contains(&section.section_type) && section.position >= 0
}

/// A kit is storable when it has a name and at least one header image.
pub fn is_valid_kit(kit: &Kit) -> bool {
    !kit.name.trim().is_empty()
        && (is_present(&kit.header_desktop_image) || is_present(&kit.header_mobile_image))
}

/// Collapse the empty and `"none"` spellings of "no fundraiser" to `None`.
pub fn normalize_fundraiser_ref(reference: Option<&str>) -> Option<String> {
    let trimmed = reference?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NO_FUNDRAISER_SENTINEL) {
        None
    } else {
        Some(trimmed.to_string())
    }
}
