//! Turn one Telegram message into stored items: its attachments first, then
//! the message record that names them.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use teloxide::types::Message;

use tab_core::{
    domain::{ChatId, MessageId, MessageKind, MessageRecord, Sender},
    item::{derive_extension, IncomingItem, ItemName},
    store::AttachmentStore,
    Error, Result,
};

/// Where attachment bytes come from.
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn download(&self, file_id: &str, dst: &mut tokio::fs::File) -> anyhow::Result<()>;
}

/// An attachment referenced by a message, with the item name it is stored under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentRef {
    pub file_id: String,
    pub name: ItemName,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub record: PathBuf,
    pub attachments: Vec<PathBuf>,
    pub failed_attachments: usize,
}

pub fn message_kind(msg: &Message) -> MessageKind {
    if msg.photo().is_some() {
        MessageKind::Photo
    } else if msg.document().is_some() {
        MessageKind::Document
    } else if msg.text().is_some() {
        MessageKind::Text
    } else {
        MessageKind::Other
    }
}

/// Photos: only the largest size (Telegram sends several re-encoded JPEGs).
/// Documents: the file id plus the original name's extension.
pub fn attachments_of(msg: &Message) -> Result<Vec<AttachmentRef>> {
    let mut out = Vec::new();

    if let Some(best) = msg.photo().and_then(|sizes| sizes.last()) {
        out.push(AttachmentRef {
            file_id: best.file.id.clone(),
            name: ItemName::attachment(&best.file.id, Some("jpeg"))?,
        });
    }

    if let Some(doc) = msg.document() {
        let mime = doc.mime_type.as_ref().map(|m| m.essence_str().to_string());
        let ext = derive_extension(doc.file_name.as_deref(), mime.as_deref());
        out.push(AttachmentRef {
            file_id: doc.file.id.clone(),
            name: ItemName::attachment(&doc.file.id, ext.as_deref())?,
        });
    }

    Ok(out)
}

pub fn build_record(msg: &Message, attachments: Vec<String>) -> Result<MessageRecord> {
    Ok(MessageRecord {
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        timestamp: msg.date.timestamp(),
        received_at: Utc::now().to_rfc3339(),
        sender: msg.from().map(|u| Sender {
            id: u.id.0,
            username: u.username.clone(),
            first_name: u.first_name.clone(),
        }),
        kind: message_kind(msg),
        attachments,
        event: serde_json::to_value(msg)?,
    })
}

/// Persist `msg` and its attachments.
///
/// A failed attachment download is logged and counted; the message record is
/// still written. A failed record write is returned to the caller.
pub async fn archive_message(
    source: &dyn AttachmentSource,
    store: &AttachmentStore,
    msg: &Message,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let mut stored = Vec::new();

    for att in attachments_of(msg)? {
        match store_attachment(source, store, &att).await {
            Ok(path) => {
                stored.push(att.name.to_string());
                report.attachments.push(path);
            }
            Err(e) => {
                tracing::warn!(file_id = %att.file_id, error = %e, "failed to archive attachment");
                report.failed_attachments += 1;
            }
        }
    }

    let record = build_record(msg, stored)?;
    report.record = store.put(&IncomingItem::message(&record)?).await?;

    tracing::debug!(
        chat_id = record.chat_id.0,
        message_id = record.message_id.0,
        attachments = report.attachments.len(),
        "archived message"
    );
    Ok(report)
}

async fn store_attachment(
    source: &dyn AttachmentSource,
    store: &AttachmentStore,
    att: &AttachmentRef,
) -> Result<PathBuf> {
    let mut pending = store.stage(att.name.clone()).await?;
    source
        .download(&att.file_id, pending.file_mut())
        .await
        .map_err(|e| Error::External(format!("download {}: {e}", att.file_id)))?;
    pending.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    };
    use tokio::io::AsyncWriteExt;

    fn tmp(prefix: &str) -> PathBuf {
        static N: AtomicU64 = AtomicU64::new(0);
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let pid = std::process::id();
        let n = N.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}-{n}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Serves `bytes-of-<file_id>`; fails for ids listed in `broken`.
    #[derive(Default)]
    struct FakeSource {
        broken: Vec<String>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AttachmentSource for FakeSource {
        async fn download(&self, file_id: &str, dst: &mut tokio::fs::File) -> anyhow::Result<()> {
            self.requested.lock().unwrap().push(file_id.to_string());
            if self.broken.iter().any(|b| b == file_id) {
                anyhow::bail!("file is gone");
            }
            dst.write_all(format!("bytes-of-{file_id}").as_bytes())
                .await?;
            Ok(())
        }
    }

    fn message(extra: serde_json::Value) -> Message {
        let mut base = serde_json::json!({
            "message_id": 42,
            "date": 100,
            "chat": {"id": 777, "type": "private", "first_name": "Ada"},
            "from": {"id": 777, "is_bot": false, "first_name": "Ada", "username": "ada"},
        });
        for (k, v) in extra.as_object().unwrap() {
            base[k] = v.clone();
        }
        serde_json::from_value(base).unwrap()
    }

    fn photo_message() -> Message {
        message(serde_json::json!({
            "photo": [
                {"file_id": "small", "file_unique_id": "s", "width": 90, "height": 90, "file_size": 10},
                {"file_id": "large", "file_unique_id": "l", "width": 1280, "height": 1280, "file_size": 900}
            ],
            "caption": "sunset"
        }))
    }

    fn document_message(file_name: &str) -> Message {
        message(serde_json::json!({
            "document": {
                "file_id": "BQACdoc",
                "file_unique_id": "d",
                "file_name": file_name,
                "mime_type": "application/pdf",
                "file_size": 1234
            }
        }))
    }

    #[test]
    fn photo_uses_largest_size_as_jpeg() {
        let msg = photo_message();
        assert_eq!(message_kind(&msg), MessageKind::Photo);
        let atts = attachments_of(&msg).unwrap();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].file_id, "large");
        assert_eq!(atts[0].name.as_str(), "large.jpeg");
    }

    #[test]
    fn document_keeps_original_extension() {
        let msg = document_message("Quarterly Report.PDF");
        assert_eq!(message_kind(&msg), MessageKind::Document);
        let atts = attachments_of(&msg).unwrap();
        assert_eq!(atts[0].name.as_str(), "BQACdoc.pdf");
    }

    #[test]
    fn record_carries_sender_and_raw_event() {
        let msg = message(serde_json::json!({"text": "hello"}));
        let record = build_record(&msg, Vec::new()).unwrap();
        assert_eq!(record.timestamp, 100);
        assert_eq!(record.kind, MessageKind::Text);
        assert_eq!(record.discriminator(), "777_42");
        let sender = record.sender.unwrap();
        assert_eq!(sender.first_name, "Ada");
        assert_eq!(sender.username.as_deref(), Some("ada"));
        assert_eq!(record.event["text"], "hello");
    }

    #[tokio::test]
    async fn photo_message_stores_record_and_attachment() {
        let base = tmp("tab-ingest-photo");
        let store = AttachmentStore::new(base.join("data"), base.join("scratch"));
        let source = FakeSource::default();

        let report = archive_message(&source, &store, &photo_message())
            .await
            .unwrap();
        assert_eq!(report.record, base.join("data").join("100_777_42.json"));
        assert_eq!(report.attachments, vec![base.join("data").join("large.jpeg")]);
        assert_eq!(
            std::fs::read(base.join("data").join("large.jpeg")).unwrap(),
            b"bytes-of-large"
        );

        let record: MessageRecord =
            serde_json::from_slice(&std::fs::read(&report.record).unwrap()).unwrap();
        assert_eq!(record.attachments, vec!["large.jpeg".to_string()]);
        assert_eq!(record.event["caption"], "sunset");

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn failed_download_still_records_message() {
        let base = tmp("tab-ingest-broken");
        let store = AttachmentStore::new(base.join("data"), base.join("scratch"));
        let source = FakeSource {
            broken: vec!["BQACdoc".to_string()],
            ..FakeSource::default()
        };

        let report = archive_message(&source, &store, &document_message("a.pdf"))
            .await
            .unwrap();
        assert_eq!(report.failed_attachments, 1);
        assert!(report.attachments.is_empty());
        assert_eq!(*source.requested.lock().unwrap(), vec!["BQACdoc".to_string()]);

        let names: Vec<_> = std::fs::read_dir(base.join("data"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["100_777_42.json".to_string()]);
        // The broken download left nothing in scratch space.
        assert_eq!(std::fs::read_dir(base.join("scratch")).unwrap().count(), 0);

        let _ = std::fs::remove_dir_all(&base);
    }
}
