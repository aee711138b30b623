//! Support read-model: users, operators, conversations and messages.
//!
//! This is the narrow slice of the support platform the automation engine
//! reads (status, tags, message counts, last activity) and writes (status
//! changes, tags, operator assignment, bot messages). Multi-step updates
//! such as "merge these tags" run inside a single [`Database::execute`]
//! closure, so they are atomic with respect to other writers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// An end user of the support platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportUser {
    pub id: String,
    pub display_name: Option<String>,
    /// Messaging platform, e.g. `telegram`.
    pub platform: String,
    /// Platform-specific delivery address (chat id, phone number, ...).
    pub platform_address: String,
    pub status: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub display_name: Option<String>,
    pub platform: String,
    pub platform_address: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub id: String,
    pub name: String,
    pub role: Option<String>,
    pub is_active: bool,
    pub is_available: bool,
    pub created_at: i64,
}

/// An active operator together with how many non-closed conversations
/// are currently assigned to them.
#[derive(Debug, Clone)]
pub struct OperatorLoad {
    pub operator: Operator,
    pub open_conversations: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub assigned_operator_id: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub assigned_at: Option<i64>,
    pub last_message_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    User,
    Operator,
    Bot,
}

impl MessageSender {
    fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "user" => Ok(Self::User),
            "operator" => Ok(Self::Operator),
            "bot" => Ok(Self::Bot),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown message sender: {other}"
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Operator => "operator",
            Self::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: MessageSender,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  DirectoryStore
// ═══════════════════════════════════════════════════════════════════════

const USER_COLUMNS: &str =
    "id, display_name, platform, platform_address, status, tags, metadata, created_at, updated_at";
const OPERATOR_COLUMNS: &str = "id, name, role, is_active, is_available, created_at";
const CONVERSATION_COLUMNS: &str = "id, user_id, assigned_operator_id, status, tags, metadata, \
     assigned_at, last_message_at, created_at, updated_at";

#[derive(Clone)]
pub struct DirectoryStore {
    db: Database,
}

impl DirectoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── users ────────────────────────────────────────────────────────

    #[instrument(skip(self, user), fields(platform = %user.platform))]
    pub async fn create_user(&self, user: NewUser) -> StoreResult<SupportUser> {
        let now = Utc::now().timestamp();
        let stored = SupportUser {
            id: Uuid::now_v7().to_string(),
            display_name: user.display_name,
            platform: user.platform,
            platform_address: user.platform_address,
            status: user.status,
            tags: dedup_tags(user.tags),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let tags_json = serde_json::to_string(&stored.tags)?;
        let row = stored.clone();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, display_name, platform, platform_address, status, tags, \
                     metadata, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}', ?7, ?7)",
                    rusqlite::params![
                        row.id,
                        row.display_name,
                        row.platform,
                        row.platform_address,
                        row.status,
                        tags_json,
                        row.created_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(user_id = %stored.id, "user created");
        Ok(stored)
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, id: &str) -> StoreResult<Option<SupportUser>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    rusqlite::params![id],
                    UserRow::from_row,
                );
                match result {
                    Ok(row) => row.into_user().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Set a user's status and store `stamp` under `metadata[stamp_key]`.
    ///
    /// When `stamp` is an object it gains a `previous_status` field read in
    /// the same critical section. Returns the previous status.
    #[instrument(skip(self, stamp))]
    pub async fn update_user_status(
        &self,
        id: &str,
        status: &str,
        stamp_key: &str,
        stamp: serde_json::Value,
    ) -> StoreResult<String> {
        let id = id.to_string();
        let status = status.to_string();
        let path = json_path(stamp_key);
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let previous: String = match conn.query_row(
                    "SELECT status FROM users WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                ) {
                    Ok(previous) => previous,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        return Err(StoreError::NotFound { entity: "user", id });
                    }
                    Err(e) => return Err(e.into()),
                };

                let mut stamp = stamp;
                if let Some(fields) = stamp.as_object_mut() {
                    fields.insert("previous_status".into(), previous.clone().into());
                }
                let stamp_json = serde_json::to_string(&stamp)?;

                conn.execute(
                    "UPDATE users SET status = ?2, metadata = json_set(metadata, ?3, json(?4)), \
                     updated_at = ?5 WHERE id = ?1",
                    rusqlite::params![id, status, path, stamp_json, now],
                )?;
                debug!(user_id = %id, from = %previous, to = %status, "user status updated");
                Ok(previous)
            })
            .await
    }

    /// Merge `tags` into the user's tag set (deduplicated, order kept) and
    /// stamp `metadata[stamp_key]`. Returns the resulting tag set.
    #[instrument(skip(self, tags, stamp))]
    pub async fn add_user_tags(
        &self,
        id: &str,
        tags: Vec<String>,
        stamp_key: &str,
        stamp: serde_json::Value,
    ) -> StoreResult<Vec<String>> {
        self.merge_tags("users", "user", id, tags, stamp_key, stamp)
            .await
    }

    // ── operators ────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn create_operator(
        &self,
        name: &str,
        role: Option<&str>,
        is_available: bool,
    ) -> StoreResult<Operator> {
        let operator = Operator {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            role: role.map(str::to_string),
            is_active: true,
            is_available,
            created_at: Utc::now().timestamp(),
        };
        let row = operator.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO operators (id, name, role, is_active, is_available, created_at) \
                     VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                    rusqlite::params![row.id, row.name, row.role, row.is_available, row.created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(operator)
    }

    #[instrument(skip(self))]
    pub async fn get_operator(&self, id: &str) -> StoreResult<Option<Operator>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {OPERATOR_COLUMNS} FROM operators WHERE id = ?1"),
                    rusqlite::params![id],
                    operator_from_row,
                );
                match result {
                    Ok(op) => Ok(Some(op)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_operator_state(
        &self,
        id: &str,
        is_active: bool,
        is_available: bool,
    ) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE operators SET is_active = ?2, is_available = ?3 WHERE id = ?1",
                    rusqlite::params![id, is_active, is_available],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "operator",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Active operators with their open-conversation counts, ordered by id.
    #[instrument(skip(self))]
    pub async fn operator_loads(&self) -> StoreResult<Vec<OperatorLoad>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT o.id, o.name, o.role, o.is_active, o.is_available, o.created_at, \
                       (SELECT COUNT(*) FROM conversations c \
                        WHERE c.assigned_operator_id = o.id AND c.status != 'closed') \
                     FROM operators o WHERE o.is_active = 1 ORDER BY o.id",
                )?;
                let loads = stmt
                    .query_map([], |row| {
                        Ok(OperatorLoad {
                            operator: operator_from_row(row)?,
                            open_conversations: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(loads)
            })
            .await
    }

    /// Number of assignments each active operator received since `since`,
    /// ordered by operator id. Operators with none are included with 0.
    #[instrument(skip(self))]
    pub async fn recent_assignment_counts(&self, since: i64) -> StoreResult<Vec<(Operator, i64)>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT o.id, o.name, o.role, o.is_active, o.is_available, o.created_at, \
                       (SELECT COUNT(*) FROM operator_assignments a \
                        WHERE a.operator_id = o.id AND a.assigned_at >= ?1) \
                     FROM operators o WHERE o.is_active = 1 ORDER BY o.id",
                )?;
                let counts = stmt
                    .query_map(rusqlite::params![since], |row| {
                        Ok((operator_from_row(row)?, row.get::<_, i64>(6)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(counts)
            })
            .await
    }

    /// Pick the next active operator after the one recorded under
    /// `cursor_key`, wrapping around, and advance the cursor.
    ///
    /// Returns `None` when there are no active operators.
    #[instrument(skip(self))]
    pub async fn next_round_robin_operator(&self, cursor_key: &str) -> StoreResult<Option<Operator>> {
        let cursor_key = cursor_key.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {OPERATOR_COLUMNS} FROM operators WHERE is_active = 1 ORDER BY id"
                ))?;
                let operators = stmt
                    .query_map([], operator_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                if operators.is_empty() {
                    return Ok(None);
                }

                let cursor: Option<String> = match conn.query_row(
                    "SELECT value FROM engine_state WHERE key = ?1",
                    rusqlite::params![cursor_key],
                    |row| row.get(0),
                ) {
                    Ok(value) => Some(value),
                    Err(rusqlite::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e.into()),
                };

                // First operator strictly after the cursor, else wrap.
                let next = cursor
                    .and_then(|last| operators.iter().find(|op| op.id > last).cloned())
                    .unwrap_or_else(|| operators[0].clone());

                conn.execute(
                    "INSERT INTO engine_state (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![cursor_key, next.id],
                )?;
                Ok(Some(next))
            })
            .await
    }

    // ── conversations ────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn open_conversation(&self, user_id: &str) -> StoreResult<Conversation> {
        let now = Utc::now().timestamp();
        let conversation = Conversation {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            assigned_operator_id: None,
            status: "open".into(),
            tags: Vec::new(),
            metadata: serde_json::json!({}),
            assigned_at: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        let row = conversation.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO conversations (id, user_id, status, tags, metadata, created_at, updated_at) \
                     VALUES (?1, ?2, 'open', '[]', '{}', ?3, ?3)",
                    rusqlite::params![row.id, row.user_id, row.created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    #[instrument(skip(self))]
    pub async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                    rusqlite::params![id],
                    ConversationRow::from_row,
                );
                match result {
                    Ok(row) => row.into_conversation().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Point a conversation at an operator and record the assignment.
    #[instrument(skip(self))]
    pub async fn assign_operator(
        &self,
        conversation_id: &str,
        operator_id: &str,
        at: i64,
    ) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        let operator_id = operator_id.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE conversations SET assigned_operator_id = ?2, assigned_at = ?3, \
                     updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![conversation_id, operator_id, at],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "conversation",
                        id: conversation_id,
                    });
                }
                tx.execute(
                    "INSERT INTO operator_assignments (conversation_id, operator_id, assigned_at) \
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![conversation_id, operator_id, at],
                )?;
                tx.commit()?;
                debug!(%conversation_id, %operator_id, "operator assigned");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_conversation_status(&self, id: &str, status: &str) -> StoreResult<()> {
        let id = id.to_string();
        let status = status.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "conversation",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Merge `tags` into the conversation's tag set and stamp metadata.
    #[instrument(skip(self, tags, stamp))]
    pub async fn add_conversation_tags(
        &self,
        id: &str,
        tags: Vec<String>,
        stamp_key: &str,
        stamp: serde_json::Value,
    ) -> StoreResult<Vec<String>> {
        self.merge_tags("conversations", "conversation", id, tags, stamp_key, stamp)
            .await
    }

    // ── messages ─────────────────────────────────────────────────────

    /// Append a message and bump the conversation's `last_message_at`.
    #[instrument(skip(self, content, metadata))]
    pub async fn append_message(
        &self,
        conversation_id: &str,
        sender: MessageSender,
        content: &str,
        metadata: serde_json::Value,
        at: i64,
    ) -> StoreResult<Message> {
        let message = Message {
            id: Uuid::now_v7().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            content: content.to_string(),
            metadata,
            created_at: at,
        };
        let metadata_json = serde_json::to_string(&message.metadata)?;
        let row = message.clone();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let touched = tx.execute(
                    "UPDATE conversations SET \
                       last_message_at = MAX(COALESCE(last_message_at, ?2), ?2), updated_at = ?2 \
                     WHERE id = ?1",
                    rusqlite::params![row.conversation_id, row.created_at],
                )?;
                if touched == 0 {
                    return Err(StoreError::NotFound {
                        entity: "conversation",
                        id: row.conversation_id,
                    });
                }
                tx.execute(
                    "INSERT INTO messages (id, conversation_id, sender, content, metadata, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        row.id,
                        row.conversation_id,
                        row.sender.as_str(),
                        row.content,
                        metadata_json,
                        row.created_at
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(message)
    }

    #[instrument(skip(self))]
    pub async fn message_count(&self, conversation_id: &str) -> StoreResult<i64> {
        let conversation_id = conversation_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                    rusqlite::params![conversation_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Timestamp of the newest message, `None` for an empty conversation.
    #[instrument(skip(self))]
    pub async fn last_message_at(&self, conversation_id: &str) -> StoreResult<Option<i64>> {
        let conversation_id = conversation_id.to_string();
        self.db
            .execute(move |conn| {
                let at: Option<i64> = conn.query_row(
                    "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                    rusqlite::params![conversation_id],
                    |row| row.get(0),
                )?;
                Ok(at)
            })
            .await
    }

    /// Messages of a conversation in chronological order.
    #[instrument(skip(self))]
    pub async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, sender, content, metadata, created_at \
                     FROM messages WHERE conversation_id = ?1 ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![conversation_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(id, conversation_id, sender, content, metadata, created_at)| {
                        Ok(Message {
                            id,
                            conversation_id,
                            sender: MessageSender::parse(&sender)?,
                            content,
                            metadata: serde_json::from_str(&metadata)?,
                            created_at,
                        })
                    })
                    .collect()
            })
            .await
    }

    // ── internals ────────────────────────────────────────────────────

    async fn merge_tags(
        &self,
        table: &'static str,
        entity: &'static str,
        id: &str,
        tags: Vec<String>,
        stamp_key: &str,
        stamp: serde_json::Value,
    ) -> StoreResult<Vec<String>> {
        let id = id.to_string();
        let path = json_path(stamp_key);
        let stamp_json = serde_json::to_string(&stamp)?;
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let current: String = match conn.query_row(
                    &format!("SELECT tags FROM {table} WHERE id = ?1"),
                    rusqlite::params![id],
                    |row| row.get(0),
                ) {
                    Ok(current) => current,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        return Err(StoreError::NotFound { entity, id });
                    }
                    Err(e) => return Err(e.into()),
                };

                let mut merged: Vec<String> = serde_json::from_str(&current)?;
                merged.extend(tags);
                let merged = dedup_tags(merged);
                let merged_json = serde_json::to_string(&merged)?;

                conn.execute(
                    &format!(
                        "UPDATE {table} SET tags = ?2, metadata = json_set(metadata, ?3, json(?4)), \
                         updated_at = ?5 WHERE id = ?1"
                    ),
                    rusqlite::params![id, merged_json, path, stamp_json, now],
                )?;
                debug!(%entity, %id, tags = merged.len(), "tags merged");
                Ok(merged)
            })
            .await
    }
}

/// Trim, drop empties and deduplicate while keeping first-seen order.
fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// `status_change` -> `$."status_change"`.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

fn operator_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operator> {
    Ok(Operator {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        is_active: row.get(3)?,
        is_available: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct UserRow {
    id: String,
    display_name: Option<String>,
    platform: String,
    platform_address: String,
    status: String,
    tags: String,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            platform: row.get(2)?,
            platform_address: row.get(3)?,
            status: row.get(4)?,
            tags: row.get(5)?,
            metadata: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_user(self) -> StoreResult<SupportUser> {
        Ok(SupportUser {
            tags: serde_json::from_str(&self.tags)?,
            metadata: serde_json::from_str(&self.metadata)?,
            id: self.id,
            display_name: self.display_name,
            platform: self.platform,
            platform_address: self.platform_address,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ConversationRow {
    id: String,
    user_id: String,
    assigned_operator_id: Option<String>,
    status: String,
    tags: String,
    metadata: String,
    assigned_at: Option<i64>,
    last_message_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl ConversationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            assigned_operator_id: row.get(2)?,
            status: row.get(3)?,
            tags: row.get(4)?,
            metadata: row.get(5)?,
            assigned_at: row.get(6)?,
            last_message_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_conversation(self) -> StoreResult<Conversation> {
        Ok(Conversation {
            tags: serde_json::from_str(&self.tags)?,
            metadata: serde_json::from_str(&self.metadata)?,
            id: self.id,
            user_id: self.user_id,
            assigned_operator_id: self.assigned_operator_id,
            status: self.status,
            assigned_at: self.assigned_at,
            last_message_at: self.last_message_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> DirectoryStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        DirectoryStore::new(db)
    }

    fn telegram_user(status: &str) -> NewUser {
        NewUser {
            display_name: Some("Ada".into()),
            platform: "telegram".into(),
            platform_address: "4242".into(),
            status: status.into(),
            tags: vec!["beta".into(), "beta".into()],
        }
    }

    #[tokio::test]
    async fn create_user_dedups_tags() {
        let dir = setup().await;
        let user = dir.create_user(telegram_user("new")).await.unwrap();
        assert_eq!(user.tags, vec!["beta".to_string()]);

        let fetched = dir.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(fetched.platform_address, "4242");
        assert_eq!(fetched.metadata, json!({}));
    }

    #[tokio::test]
    async fn update_user_status_stamps_metadata() {
        let dir = setup().await;
        let user = dir.create_user(telegram_user("new")).await.unwrap();

        let previous = dir
            .update_user_status(&user.id, "vip", "status_change", json!({"reason": "spent a lot"}))
            .await
            .unwrap();
        assert_eq!(previous, "new");

        let fetched = dir.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, "vip");
        assert_eq!(
            fetched.metadata["status_change"]["reason"],
            json!("spent a lot")
        );
        assert_eq!(
            fetched.metadata["status_change"]["previous_status"],
            json!("new")
        );
    }

    #[tokio::test]
    async fn update_status_of_missing_user_is_not_found() {
        let dir = setup().await;
        let err = dir
            .update_user_status("ghost", "vip", "status_change", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "user", .. }));
    }

    #[tokio::test]
    async fn tags_merge_without_duplicates() {
        let dir = setup().await;
        let user = dir.create_user(telegram_user("new")).await.unwrap();
        let conversation = dir.open_conversation(&user.id).await.unwrap();

        let tags = dir
            .add_conversation_tags(
                &conversation.id,
                vec!["billing".into(), "urgent".into()],
                "last_tagged",
                json!({"by": "test"}),
            )
            .await
            .unwrap();
        assert_eq!(tags, vec!["billing".to_string(), "urgent".to_string()]);

        let tags = dir
            .add_conversation_tags(
                &conversation.id,
                vec!["urgent".into(), "refund".into()],
                "last_tagged",
                json!({"by": "test"}),
            )
            .await
            .unwrap();
        assert_eq!(tags, vec!["billing", "urgent", "refund"]);

        let user_tags = dir
            .add_user_tags(&user.id, vec!["vip".into()], "last_tagged", json!({}))
            .await
            .unwrap();
        assert_eq!(user_tags, vec!["beta", "vip"]);
    }

    #[tokio::test]
    async fn messages_update_counts_and_activity() {
        let dir = setup().await;
        let user = dir.create_user(telegram_user("new")).await.unwrap();
        let conversation = dir.open_conversation(&user.id).await.unwrap();

        assert_eq!(dir.message_count(&conversation.id).await.unwrap(), 0);
        assert_eq!(dir.last_message_at(&conversation.id).await.unwrap(), None);

        for (i, at) in [100, 250, 180].into_iter().enumerate() {
            dir.append_message(
                &conversation.id,
                MessageSender::User,
                &format!("msg {i}"),
                json!({}),
                at,
            )
            .await
            .unwrap();
        }

        assert_eq!(dir.message_count(&conversation.id).await.unwrap(), 3);
        assert_eq!(dir.last_message_at(&conversation.id).await.unwrap(), Some(250));
        let fetched = dir.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_message_at, Some(250));

        let messages = dir.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages[0].content, "msg 0");
        assert_eq!(messages[2].content, "msg 1");
    }

    #[tokio::test]
    async fn loads_count_open_conversations_only() {
        let dir = setup().await;
        let user = dir.create_user(telegram_user("new")).await.unwrap();
        let alice = dir.create_operator("alice", Some("senior"), true).await.unwrap();
        let bob = dir.create_operator("bob", None, true).await.unwrap();

        let c1 = dir.open_conversation(&user.id).await.unwrap();
        let c2 = dir.open_conversation(&user.id).await.unwrap();
        dir.assign_operator(&c1.id, &alice.id, 10).await.unwrap();
        dir.assign_operator(&c2.id, &alice.id, 20).await.unwrap();
        dir.set_conversation_status(&c2.id, "closed").await.unwrap();

        let loads = dir.operator_loads().await.unwrap();
        let alice_load = loads.iter().find(|l| l.operator.id == alice.id).unwrap();
        let bob_load = loads.iter().find(|l| l.operator.id == bob.id).unwrap();
        assert_eq!(alice_load.open_conversations, 1);
        assert_eq!(bob_load.open_conversations, 0);

        let recent = dir.recent_assignment_counts(15).await.unwrap();
        let alice_recent = recent.iter().find(|(op, _)| op.id == alice.id).unwrap();
        assert_eq!(alice_recent.1, 1);
    }

    #[tokio::test]
    async fn round_robin_cycles_and_skips_inactive() {
        let dir = setup().await;
        let a = dir.create_operator("a", None, true).await.unwrap();
        let b = dir.create_operator("b", None, true).await.unwrap();
        let c = dir.create_operator("c", None, true).await.unwrap();

        let picks: Vec<String> = {
            let mut picks = Vec::new();
            for _ in 0..4 {
                picks.push(dir.next_round_robin_operator("rr").await.unwrap().unwrap().id);
            }
            picks
        };
        assert_eq!(picks, vec![a.id.clone(), b.id.clone(), c.id.clone(), a.id.clone()]);

        dir.set_operator_state(&b.id, false, false).await.unwrap();
        let next = dir.next_round_robin_operator("rr").await.unwrap().unwrap();
        assert_eq!(next.id, c.id);
    }

    #[tokio::test]
    async fn round_robin_without_operators_is_none() {
        let dir = setup().await;
        assert!(dir.next_round_robin_operator("rr").await.unwrap().is_none());
    }
}
