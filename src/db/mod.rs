pub mod models;

use crate::conversation::storage::{AttachmentStore, ConversationStorage, StorageError};
use models::{
    Attachment, AttachmentId, AttachmentKind, Conversation, ConversationId, ConversationSummary,
    Message, MessageStatus, Role,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (creating if needed) `polychat.db` inside `app_dir`.
    pub fn new(app_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(app_dir)?;
        Self::open(&app_dir.join("polychat.db"))
    }

    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        tracing::debug!(path = %db_path.display(), "opened database");
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                image_id TEXT,
                document_id TEXT,
                model TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, seq);

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('image', 'document')),
                mime_type TEXT NOT NULL,
                filename TEXT NOT NULL,
                bytes BLOB NOT NULL,
                text TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn status_columns(status: &MessageStatus) -> (&'static str, Option<&str>) {
    match status {
        MessageStatus::Streaming => ("streaming", None),
        MessageStatus::Complete => ("complete", None),
        MessageStatus::Truncated => ("truncated", None),
        MessageStatus::Failed { error } => ("failed", Some(error.as_str())),
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Message, StorageError>> {
    let id: String = row.get(0)?;
    let role: String = row.get(1)?;
    let status: String = row.get(6)?;
    let error: Option<String> = row.get(7)?;

    let Some(role) = Role::parse(&role) else {
        return Ok(Err(StorageError::Corrupt(format!(
            "message {id} has unknown role {role:?}"
        ))));
    };
    let status = match status.as_str() {
        // A message still streaming when the process stopped never finished.
        "streaming" | "truncated" => MessageStatus::Truncated,
        "complete" => MessageStatus::Complete,
        "failed" => MessageStatus::Failed {
            error: error.unwrap_or_default(),
        },
        other => {
            return Ok(Err(StorageError::Corrupt(format!(
                "message {id} has unknown status {other:?}"
            ))))
        }
    };

    Ok(Ok(Message {
        id: id.into(),
        role,
        content: row.get(2)?,
        image: row.get::<_, Option<String>>(3)?.map(AttachmentId::from),
        document: row.get::<_, Option<String>>(4)?.map(AttachmentId::from),
        model: row.get(5)?,
        status,
        timestamp: row.get(8)?,
    }))
}

impl ConversationStorage for Database {
    fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StorageError> {
        let conn = self.conn();
        let header = conn
            .query_row(
                "SELECT title, created_at FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((title, created_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, role, content, image_id, document_id, model, status, error, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![id.as_str()], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }

        Ok(Some(Conversation {
            id: id.clone(),
            title,
            messages,
            created_at,
        }))
    }

    fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = datetime('now')",
            params![
                conversation.id.as_str(),
                conversation.title,
                conversation.created_at
            ],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation.id.as_str()],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO messages
                 (id, conversation_id, seq, role, content, image_id, document_id,
                  model, status, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for (seq, message) in conversation.messages.iter().enumerate() {
                let (status, error) = status_columns(&message.status);
                insert.execute(params![
                    message.id.as_str(),
                    conversation.id.as_str(),
                    seq as i64,
                    message.role.as_str(),
                    message.content,
                    message.image.as_ref().map(AttachmentId::as_str),
                    message.document.as_ref().map(AttachmentId::as_str),
                    message.model,
                    status,
                    error,
                    message.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &ConversationId) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.title, c.created_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
             FROM conversations c ORDER BY c.created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ConversationSummary {
                id: row.get::<_, String>(0)?.into(),
                title: row.get(1)?,
                created_at: row.get(2)?,
                message_count: row.get::<_, i64>(3)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl AttachmentStore for Database {
    fn put_attachment(&self, attachment: &Attachment) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO attachments (id, kind, mime_type, filename, bytes, text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attachment.id.as_str(),
                attachment.kind.as_str(),
                attachment.mime_type,
                attachment.filename,
                attachment.bytes,
                attachment.text,
            ],
        )?;
        Ok(())
    }

    fn get_attachment(&self, id: &AttachmentId) -> Result<Option<Attachment>, StorageError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT kind, mime_type, filename, bytes, text FROM attachments WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((kind, mime_type, filename, bytes, text)) = row else {
            return Ok(None);
        };
        let kind = match kind.as_str() {
            "image" => AttachmentKind::Image,
            "document" => AttachmentKind::Document,
            other => {
                return Err(StorageError::Corrupt(format!(
                    "attachment {id} has unknown kind {other:?}"
                )))
            }
        };
        Ok(Some(Attachment {
            id: id.clone(),
            kind,
            mime_type,
            filename,
            bytes,
            text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use models::MessageId;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database) {
        let temp = TempDir::new().unwrap();
        let db = Database::new(temp.path()).unwrap();
        (temp, db)
    }

    fn message(role: Role, content: &str, status: MessageStatus) -> Message {
        Message {
            id: MessageId::new(),
            role,
            content: content.to_string(),
            image: None,
            document: None,
            timestamp: Utc::now(),
            model: Some("openai/gpt-4o".to_string()),
            status,
        }
    }

    #[test]
    fn test_conversation_roundtrip_keeps_order_and_status() {
        let (_temp, db) = setup();
        let conversation = Conversation {
            id: ConversationId::new(),
            title: "Hello there...".to_string(),
            messages: vec![
                message(Role::User, "first", MessageStatus::Complete),
                message(Role::Assistant, "partial", MessageStatus::Truncated),
                message(Role::User, "second", MessageStatus::Complete),
                message(
                    Role::Assistant,
                    "",
                    MessageStatus::Failed {
                        error: "API error: 429 - slow down".to_string(),
                    },
                ),
            ],
            created_at: Utc::now(),
        };

        db.save(&conversation).unwrap();
        let loaded = db.load(&conversation.id).unwrap().unwrap();

        assert_eq!(loaded.title, conversation.title);
        let contents: Vec<&str> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "partial", "second", ""]);
        assert_eq!(loaded.messages[1].status, MessageStatus::Truncated);
        assert_eq!(loaded.messages[3].status, conversation.messages[3].status);
        assert_eq!(loaded.messages[0].id, conversation.messages[0].id);
    }

    #[test]
    fn test_save_replaces_messages() {
        let (_temp, db) = setup();
        let mut conversation = Conversation {
            id: ConversationId::new(),
            title: "t".to_string(),
            messages: vec![message(Role::User, "one", MessageStatus::Complete)],
            created_at: Utc::now(),
        };
        db.save(&conversation).unwrap();
        conversation
            .messages
            .push(message(Role::Assistant, "two", MessageStatus::Complete));
        db.save(&conversation).unwrap();

        let summaries = db.list().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 2);
    }

    #[test]
    fn test_delete_cascades() {
        let (_temp, db) = setup();
        let conversation = Conversation {
            id: ConversationId::new(),
            title: "t".to_string(),
            messages: vec![message(Role::User, "one", MessageStatus::Complete)],
            created_at: Utc::now(),
        };
        db.save(&conversation).unwrap();
        db.delete(&conversation.id).unwrap();

        assert!(db.load(&conversation.id).unwrap().is_none());
        assert!(db.list().unwrap().is_empty());
    }

    #[test]
    fn test_attachment_roundtrip() {
        let (_temp, db) = setup();
        let attachment = Attachment {
            id: AttachmentId::new(),
            kind: AttachmentKind::Image,
            mime_type: "image/png".to_string(),
            filename: "cat.png".to_string(),
            bytes: vec![0x89, b'P', b'N', b'G'],
            text: None,
        };
        db.put_attachment(&attachment).unwrap();
        assert_eq!(db.get_attachment(&attachment.id).unwrap(), Some(attachment));
        assert!(db.get_attachment(&AttachmentId::new()).unwrap().is_none());
    }

    #[test]
    fn test_settings() {
        let (_temp, db) = setup();
        assert_eq!(db.get_setting("openai_api_key").unwrap(), None);
        db.set_setting("openai_api_key", "sk-test").unwrap();
        assert_eq!(
            db.get_setting("openai_api_key").unwrap().as_deref(),
            Some("sk-test")
        );
        db.delete_setting("openai_api_key").unwrap();
        assert_eq!(db.get_setting("openai_api_key").unwrap(), None);
    }
}
