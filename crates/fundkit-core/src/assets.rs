//! Image uploads for kit headers and item images.
//!
//! Files are stored under collision-resistant keys
//! (`<folder>/<unix-millis>-<random>.<ext>`) and the resulting public URL is
//! written into the chosen kit field. A failed upload leaves the field as it was.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::error::{KitError, Result};
use crate::models::Kit;
use crate::store::ObjectStorage;

const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const KEY_SUFFIX_LEN: usize = 13;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60;

/// A kit field that holds an image URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSlot {
    HeaderDesktop,
    HeaderMobile,
    ItemImage { section: usize, item: usize },
}

impl AssetSlot {
    fn field_mut<'a>(&self, kit: &'a mut Kit) -> Option<&'a mut Option<String>> {
        match *self {
            AssetSlot::HeaderDesktop => Some(&mut kit.header_desktop_image),
            AssetSlot::HeaderMobile => Some(&mut kit.header_mobile_image),
            AssetSlot::ItemImage { section, item } => kit
                .sections
                .get_mut(section)
                .and_then(|s| s.items.get_mut(item))
                .map(|i| &mut i.image_url),
        }
    }
}

impl fmt::Display for AssetSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetSlot::HeaderDesktop => f.write_str("header.desktop"),
            AssetSlot::HeaderMobile => f.write_str("header.mobile"),
            AssetSlot::ItemImage { section, item } => {
                write!(f, "sections[{}].items[{}].image", section, item)
            }
        }
    }
}

fn bracketed(part: &str, name: &str) -> Option<usize> {
    part.strip_prefix(name)?
        .strip_prefix('[')?
        .strip_suffix(']')?
        .parse()
        .ok()
}

impl FromStr for AssetSlot {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "header.desktop" => return Ok(AssetSlot::HeaderDesktop),
            "header.mobile" => return Ok(AssetSlot::HeaderMobile),
            _ => {}
        }

        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [section, item, "image"] => {
                match (bracketed(section, "sections"), bracketed(item, "items")) {
                    (Some(section), Some(item)) => Ok(AssetSlot::ItemImage { section, item }),
                    _ => Err(format!("Unknown image destination: {}", s)),
                }
            }
            _ => Err(format!("Unknown image destination: {}", s)),
        }
    }
}

/// Lowercased extension of `name`, if it has one.
fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(OsStr::to_str)
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..KEY_SUFFIX_LEN)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

/// Storage key for a new upload of `original_name` under `folder`.
pub fn generate_key(folder: &str, original_name: &str) -> String {
    let mut key = String::new();
    let folder = folder.trim_matches('/');
    if !folder.is_empty() {
        key.push_str(folder);
        key.push('/');
    }
    key.push_str(&format!("{}-{}", Utc::now().timestamp_millis(), random_suffix()));
    if let Some(ext) = extension(original_name) {
        key.push('.');
        key.push_str(&ext);
    }
    key
}

/// MIME type guessed from the file name.
pub fn content_type(original_name: &str) -> String {
    mime_guess::from_path(original_name)
        .first_or_octet_stream()
        .to_string()
}

pub struct AssetResolver {
    storage: Arc<dyn ObjectStorage>,
    folder: String,
    timeout: Duration,
}

impl AssetResolver {
    pub fn new(storage: Arc<dyn ObjectStorage>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into(),
            timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upload a file and return its public URL.
    pub async fn upload(&self, original_name: &str, bytes: Vec<u8>) -> Result<String> {
        self.store(original_name, original_name, bytes).await
    }

    /// Upload a file and write its URL into `slot` of `kit`.
    ///
    /// The slot must exist before anything is uploaded. On any failure the kit
    /// is left unchanged.
    pub async fn attach(&self, kit: &mut Kit, slot: AssetSlot, original_name: &str, bytes: Vec<u8>) -> Result<String> {
        if slot.field_mut(kit).is_none() {
            return Err(KitError::Validation(format!("no such image destination: {}", slot)));
        }

        let url = self.store(&slot.to_string(), original_name, bytes).await?;
        if let Some(field) = slot.field_mut(kit) {
            *field = Some(url.clone());
        }
        Ok(url)
    }

    async fn store(&self, destination: &str, original_name: &str, bytes: Vec<u8>) -> Result<String> {
        let key = generate_key(&self.folder, original_name);
        let size = bytes.len();
        let mime = content_type(original_name);

        let failure = |message: String| {
            warn!(destination = destination, key = %key, "Upload failed: {}", message);
            KitError::Upload {
                destination: destination.to_string(),
                message,
            }
        };

        match tokio::time::timeout(self.timeout, self.storage.upload(&key, bytes, &mime)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(failure(e.to_string())),
            Err(_) => return Err(failure(format!("timed out after {:?}", self.timeout))),
        }

        info!(destination = destination, key = %key, bytes = size, content_type = %mime, "Uploaded image");
        Ok(self.storage.public_url(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, Section, SectionType};
    use crate::store::MemoryBucket;

    const BASE: &str = "https://p.supabase.co/storage/v1/object/public/kit_media";

    fn kit() -> Kit {
        Kit {
            name: "Spring Drive".to_string(),
            header_desktop_image: Some("https://cdn.test/old.png".to_string()),
            sections: vec![
                Section::new("Watch", SectionType::Video),
                Section::new("Share", SectionType::Social).with_items(vec![Item::new("Post")]),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_key_layout() {
        let key = generate_key("kits/", "Team Photo.PNG");
        let rest = key.strip_prefix("kits/").expect("folder prefix");
        let (stem, ext) = rest.rsplit_once('.').expect("extension");
        assert_eq!(ext, "png");

        let (millis, suffix) = stem.split_once('-').expect("timestamp and suffix");
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 13);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let bare = generate_key("", "README");
        assert!(!bare.contains('/'));
        assert!(!bare.contains('.'));
        assert_ne!(generate_key("kits", "a.png"), generate_key("kits", "a.png"));
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(content_type("banner.jpg"), "image/jpeg");
        assert_eq!(content_type("hero.PNG"), "image/png");
        assert_eq!(content_type("blob"), "application/octet-stream");
    }

    #[test]
    fn test_slot_parse_and_display() {
        for text in ["header.desktop", "header.mobile", "sections[2].items[0].image"] {
            let slot: AssetSlot = text.parse().expect("valid slot");
            assert_eq!(slot.to_string(), text);
        }
        assert_eq!(
            "sections[1].items[3].image".parse::<AssetSlot>(),
            Ok(AssetSlot::ItemImage { section: 1, item: 3 })
        );
        assert!("header.banner".parse::<AssetSlot>().is_err());
        assert!("sections[x].items[0].image".parse::<AssetSlot>().is_err());
        assert!("sections[0].items[0]".parse::<AssetSlot>().is_err());
    }

    #[tokio::test]
    async fn test_attach_header_and_item_image() {
        let bucket = Arc::new(MemoryBucket::new(BASE));
        let resolver = AssetResolver::new(bucket.clone(), "kits");
        let mut kit = kit();

        let url = resolver
            .attach(&mut kit, AssetSlot::HeaderMobile, "phone.png", vec![1, 2, 3])
            .await
            .expect("attach header");
        assert_eq!(kit.header_mobile_image.as_deref(), Some(url.as_str()));
        assert!(url.starts_with(&format!("{}/kits/", BASE)));

        let key = url.trim_start_matches(&format!("{}/", BASE));
        let (bytes, mime) = bucket.object(key).expect("stored object");
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");

        let slot = AssetSlot::ItemImage { section: 1, item: 0 };
        let url = resolver.attach(&mut kit, slot, "post.jpeg", vec![9]).await.expect("attach item image");
        assert_eq!(kit.sections[1].items[0].image_url.as_deref(), Some(url.as_str()));
        assert_eq!(bucket.keys().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_destination_uploads_nothing() {
        let bucket = Arc::new(MemoryBucket::new(BASE));
        let resolver = AssetResolver::new(bucket.clone(), "kits");
        let mut kit = kit();

        let slot = AssetSlot::ItemImage { section: 0, item: 0 };
        let result = resolver.attach(&mut kit, slot, "x.png", vec![0]).await;
        assert!(matches!(result, Err(KitError::Validation(_))));
        assert!(bucket.keys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_field_unchanged() {
        let bucket = Arc::new(MemoryBucket::new(BASE));
        bucket.set_failing(true);
        let resolver = AssetResolver::new(bucket.clone(), "kits");
        let mut kit = kit();
        let before = kit.clone();

        match resolver.attach(&mut kit, AssetSlot::HeaderDesktop, "new.png", vec![0]).await {
            Err(KitError::Upload { destination, .. }) => assert_eq!(destination, "header.desktop"),
            other => panic!("expected upload error, got {:?}", other),
        }
        assert_eq!(kit, before);
    }

    #[tokio::test]
    async fn test_slow_upload_times_out() {
        let bucket = Arc::new(MemoryBucket::new(BASE).with_latency(Duration::from_millis(200)));
        let resolver = AssetResolver::new(bucket.clone(), "kits").with_timeout(Duration::from_millis(20));
        let mut kit = kit();

        let result = resolver.attach(&mut kit, AssetSlot::HeaderMobile, "slow.png", vec![0]).await;
        assert!(matches!(result, Err(KitError::Upload { .. })));
        assert_eq!(kit.header_mobile_image, None);
    }
}
