use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::task;

use crate::models::{
    AttachmentSource, Conversation, Endpoint, FileAttachment, Message, MessageVersion,
    ProviderKind, RagSettings, Role, SavedPrompt,
};

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Fixed-width timestamps so that text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| anyhow!("Database connection lock poisoned"))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = lock(&self.conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE endpoints (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    base_url TEXT NOT NULL,
                    api_key TEXT NOT NULL,
                    model TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 0,
                    rag TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    rag_document_ids TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
                );

                CREATE TABLE message_attachments (
                    message_id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    source_kind TEXT NOT NULL,
                    source_value TEXT,
                    PRIMARY KEY (message_id, position),
                    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
                );

                CREATE TABLE message_versions (
                    id TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
                );

                CREATE TABLE saved_prompts (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX idx_conversations_updated ON conversations(updated_at DESC);
                CREATE INDEX idx_messages_conversation ON messages(conversation_id, position);
                CREATE INDEX idx_versions_message ON message_versions(message_id);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            // Retrieval documents of conversations stored on a backend server,
            // which has no field for them.
            conn.execute_batch(
                "CREATE TABLE conversation_documents (
                    conversation_id TEXT NOT NULL,
                    document_id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    PRIMARY KEY (conversation_id, document_id)
                );

                INSERT INTO schema_version (version) VALUES (2);",
            )?;
        }

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut conn)
        })
        .await?
    }

    // --- Endpoint CRUD ---

    pub async fn insert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let ep = endpoint.clone();
        self.with_conn(move |conn| {
            let rag = ep.rag.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO endpoints (id, name, kind, base_url, api_key, model, is_active, rag, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    ep.id,
                    ep.name,
                    ep.kind.as_str(),
                    ep.base_url,
                    ep.api_key,
                    ep.model,
                    ep.is_active as i32,
                    rag,
                    ts(&ep.created_at),
                    ts(&ep.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let ep = endpoint.clone();
        self.with_conn(move |conn| {
            let rag = ep.rag.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "UPDATE endpoints SET name = ?1, base_url = ?2, api_key = ?3, model = ?4, rag = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    ep.name,
                    ep.base_url,
                    ep.api_key,
                    ep.model,
                    rag,
                    ts(&ep.updated_at),
                    ep.id
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_endpoint(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM endpoints WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, base_url, api_key, model, is_active, rag, created_at, updated_at
                 FROM endpoints ORDER BY created_at ASC",
            )?;
            let endpoints = stmt
                .query_map([], |row| Ok(Self::row_to_endpoint(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(endpoints)
        })
        .await
    }

    /// Mark exactly one endpoint (or none) as active.
    pub async fn set_active_endpoint(&self, id: Option<&str>) -> Result<()> {
        let id = id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("UPDATE endpoints SET is_active = 0", [])?;
            if let Some(id) = &id {
                tx.execute(
                    "UPDATE endpoints SET is_active = 1 WHERE id = ?1",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // --- Conversation CRUD ---

    /// Insert a conversation together with the messages it already carries.
    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conv = conversation.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, title, rag_document_ids, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conv.id,
                    conv.title,
                    serde_json::to_string(&conv.rag_document_ids)?,
                    ts(&conv.created_at),
                    ts(&conv.updated_at),
                ],
            )?;
            for msg in &conv.messages {
                Self::insert_message_tx(&tx, &conv.id, msg)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Persist the title, document ids and timestamp of a conversation.
    pub async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        let id = conversation.id.clone();
        let title = conversation.title.clone();
        let rag_ids = serde_json::to_string(&conversation.rag_document_ids)?;
        let updated_at = ts(&conversation.updated_at);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE conversations SET title = ?1, rag_document_ids = ?2, updated_at = ?3 WHERE id = ?4",
                params![title, rag_ids, updated_at, id],
            )?;
            if changed == 0 {
                return Err(anyhow!("Conversation not found: {}", id));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// All conversations, most recently updated first, with their messages.
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, rag_document_ids, created_at, updated_at
                 FROM conversations ORDER BY updated_at DESC",
            )?;
            let mut conversations = stmt
                .query_map([], |row| Ok(Self::row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;

            for conv in &mut conversations {
                conv.messages = Self::list_messages_conn(conn, &conv.id)?;
            }
            Ok(conversations)
        })
        .await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let result = conn
                .query_row(
                    "SELECT id, title, rag_document_ids, created_at, updated_at
                     FROM conversations WHERE id = ?1",
                    params![id],
                    |row| Ok(Self::row_to_conversation(row)),
                )
                .optional()?;
            match result {
                Some(conv) => {
                    let mut conv = conv?;
                    conv.messages = Self::list_messages_conn(conn, &conv.id)?;
                    Ok(Some(conv))
                }
                None => Ok(None),
            }
        })
        .await
    }

    // --- Message CRUD ---

    /// Append a message after the last stored one.
    pub async fn insert_message(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let msg = message.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            Self::insert_message_tx(&tx, &conversation_id, &msg)?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![ts(&Utc::now()), conversation_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    fn insert_message_tx(tx: &Transaction<'_>, conversation_id: &str, msg: &Message) -> Result<()> {
        tx.execute(
            "INSERT INTO messages (id, conversation_id, position, role, content, created_at)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = ?2),
                     ?3, ?4, ?5)",
            params![
                msg.id,
                conversation_id,
                msg.role.as_str(),
                msg.content,
                ts(&msg.created_at),
            ],
        )?;
        for (position, file) in msg.files.iter().enumerate() {
            tx.execute(
                "INSERT INTO message_attachments (message_id, position, name, mime_type, source_kind, source_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    msg.id,
                    position as i64,
                    file.name,
                    file.mime_type,
                    file.source.kind_str(),
                    file.source.value(),
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| Self::list_messages_conn(conn, &conversation_id))
            .await
    }

    fn list_messages_conn(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY position ASC",
        )?;
        let mut messages = stmt
            .query_map(params![conversation_id], |row| Ok(Self::row_to_message(row)))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut att_stmt = conn.prepare(
            "SELECT name, mime_type, source_kind, source_value
             FROM message_attachments WHERE message_id = ?1 ORDER BY position ASC",
        )?;
        for msg in &mut messages {
            msg.files = att_stmt
                .query_map(params![msg.id], |row| Ok(Self::row_to_attachment(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(messages)
    }

    /// Replace a message's content, keeping the old content as a version.
    pub async fn update_message_content(
        &self,
        message_id: &str,
        content: &str,
        previous: &MessageVersion,
    ) -> Result<()> {
        let message_id = message_id.to_string();
        let content = content.to_string();
        let previous = previous.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE messages SET content = ?1 WHERE id = ?2",
                params![content, message_id],
            )?;
            if changed == 0 {
                return Err(anyhow!("Message not found: {}", message_id));
            }
            tx.execute(
                "INSERT INTO message_versions (id, message_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    previous.id,
                    message_id,
                    previous.content,
                    ts(&previous.created_at)
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn delete_messages(&self, conversation_id: &str, ids: &[String]) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute(
                    "DELETE FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    params![id, conversation_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Stored versions of a message, newest first.
    pub async fn list_versions(&self, message_id: &str) -> Result<Vec<MessageVersion>> {
        let message_id = message_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, content, created_at
                 FROM message_versions WHERE message_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )?;
            let versions = stmt
                .query_map(params![message_id], |row| Ok(Self::row_to_version(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
        .await
    }

    // --- Saved prompts ---

    pub async fn insert_prompt(&self, prompt: &SavedPrompt) -> Result<()> {
        let prompt = prompt.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO saved_prompts (id, name, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![prompt.id, prompt.name, prompt.content, ts(&prompt.created_at)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_prompt(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM saved_prompts WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<SavedPrompt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, content, created_at FROM saved_prompts
                 ORDER BY created_at DESC, rowid DESC",
            )?;
            let prompts = stmt
                .query_map([], |row| {
                    let created_str: String = row.get(3)?;
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, created_str))
                })?
                .collect::<Result<Vec<(String, String, String, String)>, _>>()?
                .into_iter()
                .map(|(id, name, content, created)| {
                    Ok(SavedPrompt {
                        id,
                        name,
                        content,
                        created_at: parse_ts(&created)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(prompts)
        })
        .await
    }

    // --- Settings ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let result: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    // --- Documents of remotely stored conversations ---

    pub async fn add_conversation_documents(
        &self,
        conversation_id: &str,
        document_ids: &[String],
    ) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let document_ids = document_ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let start: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM conversation_documents WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            for (offset, document_id) in document_ids.iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO conversation_documents (conversation_id, document_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![conversation_id, document_id, start + offset as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .context("Failed to save conversation documents")
    }

    /// Document ids per conversation, in upload order.
    pub async fn list_conversation_documents(&self) -> Result<HashMap<String, Vec<String>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, document_id FROM conversation_documents
                 ORDER BY conversation_id, position",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut documents: HashMap<String, Vec<String>> = HashMap::new();
            for (conversation_id, document_id) in rows {
                documents.entry(conversation_id).or_default().push(document_id);
            }
            Ok(documents)
        })
        .await
    }

    pub async fn delete_conversation_documents(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM conversation_documents WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            Ok(())
        })
        .await
    }

    // --- Row helpers ---

    fn row_to_endpoint(row: &rusqlite::Row) -> Result<Endpoint> {
        let kind_str: String = row.get(2)?;
        let is_active_int: i32 = row.get(6)?;
        let rag_json: Option<String> = row.get(7)?;
        let created_str: String = row.get(8)?;
        let updated_str: String = row.get(9)?;

        let rag: Option<RagSettings> = rag_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?;

        Ok(Endpoint {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: ProviderKind::from_str(&kind_str)
                .ok_or_else(|| anyhow!("Unknown provider kind: {}", kind_str))?,
            base_url: row.get(3)?,
            api_key: row.get(4)?,
            model: row.get(5)?,
            is_active: is_active_int != 0,
            rag,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    }

    fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
        let rag_json: String = row.get(2)?;
        let created_str: String = row.get(3)?;
        let updated_str: String = row.get(4)?;

        Ok(Conversation {
            id: row.get(0)?,
            title: row.get(1)?,
            messages: Vec::new(),
            rag_document_ids: serde_json::from_str(&rag_json)?,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let role_str: String = row.get(1)?;
        let created_str: String = row.get(3)?;

        Ok(Message {
            id: row.get(0)?,
            role: Role::from_str(&role_str).ok_or_else(|| anyhow!("Unknown role: {}", role_str))?,
            content: row.get(2)?,
            files: Vec::new(),
            created_at: parse_ts(&created_str)?,
        })
    }

    fn row_to_attachment(row: &rusqlite::Row) -> Result<FileAttachment> {
        let kind: String = row.get(2)?;
        let value: Option<String> = row.get(3)?;

        Ok(FileAttachment {
            name: row.get(0)?,
            mime_type: row.get(1)?,
            source: AttachmentSource::from_parts(&kind, value)
                .ok_or_else(|| anyhow!("Unknown attachment source: {}", kind))?,
        })
    }

    fn row_to_version(row: &rusqlite::Row) -> Result<MessageVersion> {
        let created_str: String = row.get(3)?;

        Ok(MessageVersion {
            id: row.get(0)?,
            message_id: row.get(1)?,
            content: row.get(2)?,
            created_at: parse_ts(&created_str)?,
        })
    }
}
