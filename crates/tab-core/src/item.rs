//! Items persisted into the incoming directory.

use std::fmt;

use crate::{domain::MessageRecord, errors::Error, Result};

/// A validated file name inside the incoming directory.
///
/// Only `[A-Za-z0-9._-]` survives; everything else becomes `_`. Names that are
/// empty or start with `.` are rejected so that an item can never address a
/// parent directory or hide as a dotfile.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemName(String);

impl ItemName {
    pub fn new(raw: &str) -> Result<Self> {
        let name = sanitize_component(raw);
        if name.is_empty() {
            return Err(Error::InvalidName {
                name: raw.to_string(),
                reason: "empty".to_string(),
            });
        }
        if name.starts_with('.') {
            return Err(Error::InvalidName {
                name: raw.to_string(),
                reason: "must not start with '.'".to_string(),
            });
        }
        Ok(Self(name))
    }

    /// `<ts>.json`, or `<ts>_<discriminator>.json` when one is given.
    pub fn message_record(timestamp: i64, discriminator: Option<&str>) -> Result<Self> {
        match discriminator.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => Self::new(&format!("{timestamp}_{d}.json")),
            None => Self::new(&format!("{timestamp}.json")),
        }
    }

    /// `<file-id>.<ext>`, or just `<file-id>` without a usable extension.
    pub fn attachment(file_id: &str, extension: Option<&str>) -> Result<Self> {
        let ext = extension
            .map(|e| sanitize_component(e.trim().trim_start_matches('.')))
            .filter(|e| !e.is_empty());
        match ext {
            Some(ext) => Self::new(&format!("{file_id}.{ext}")),
            None => Self::new(file_id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemKind {
    MessageRecord,
    Attachment,
}

/// One unit written by the store: a message record or an attachment.
#[derive(Clone, Debug)]
pub struct IncomingItem {
    pub name: ItemName,
    pub kind: ItemKind,
    pub content: Vec<u8>,
}

impl IncomingItem {
    pub fn message(record: &MessageRecord) -> Result<Self> {
        let name = ItemName::message_record(record.timestamp, Some(&record.discriminator()))?;
        Ok(Self {
            name,
            kind: ItemKind::MessageRecord,
            content: serde_json::to_vec_pretty(record)?,
        })
    }

    /// Raw JSON payload named after its timestamp only.
    pub fn raw_message(timestamp: i64, payload: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            name: ItemName::message_record(timestamp, None)?,
            kind: ItemKind::MessageRecord,
            content: serde_json::to_vec(payload)?,
        })
    }

    pub fn attachment(name: ItemName, bytes: Vec<u8>) -> Self {
        Self {
            name,
            kind: ItemKind::Attachment,
            content: bytes,
        }
    }
}

/// Extension for a document: the original name's suffix, else the MIME subtype.
pub fn derive_extension(file_name: Option<&str>, mime: Option<&str>) -> Option<String> {
    let from_name = file_name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(stem, ext)| (stem, ext.trim()))
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty() && ext.len() <= 10)
        .map(|(_, ext)| ext.to_lowercase());
    if from_name.is_some() {
        return from_name;
    }

    let subtype = mime?.split('/').nth(1)?;
    let subtype = subtype.split(['+', ';']).next()?.trim();
    match subtype {
        "" | "octet-stream" => None,
        "jpeg" | "pjpeg" => Some("jpeg".to_string()),
        "plain" => Some("txt".to_string()),
        other => Some(other.to_lowercase()),
    }
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
