use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::instrument;

use convoai_core::types::{ConversationId, MessageRole, ServerId, Subject, UserRole};

use crate::error::{Result, StoreError};
use crate::types::{
    Conversation, ConversationStatus, Message, NewMessage, ToolServerRegistration,
};

/// Thread-safe manager for the conversation-family store.
///
/// Wraps a single SQLite connection in a `Mutex`. All mutations to
/// conversations, messages, and tool-server registrations go through this
/// type; callers assume serialized writes per entity.
pub struct StoreManager {
    db: Mutex<Connection>,
}

impl StoreManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    // ── conversations ─────────────────────────────────────────────────────

    #[instrument(skip(self, system_prompt), fields(owner = %owner))]
    pub fn create_conversation(
        &self,
        owner: &Subject,
        title: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: ConversationId::new(),
            owner_subject: owner.clone(),
            title: title.to_string(),
            system_prompt: system_prompt.map(String::from),
            status: ConversationStatus::Active,
            created_at: Utc::now().to_rfc3339(),
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (id, owner_subject, title, system_prompt, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation.id.as_str(),
                conversation.owner_subject.as_str(),
                conversation.title,
                conversation.system_prompt,
                conversation.status.to_string(),
                conversation.created_at,
            ],
        )?;
        Ok(conversation)
    }

    /// Fetch a conversation with the read-authorization check applied:
    /// the owner always sees it, admins may read anything else.
    #[instrument(skip(self), fields(id = %id, requester = %requester))]
    pub fn get_conversation(
        &self,
        id: &ConversationId,
        requester: &Subject,
        role: UserRole,
    ) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        let conversation = load_conversation(&db, id)?;
        authorize_read(&conversation.owner_subject, requester, role)?;
        Ok(conversation)
    }

    /// All conversations owned by `owner`, newest first.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn list_conversations(&self, owner: &Subject) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, owner_subject, title, system_prompt, status, created_at
             FROM conversations
             WHERE owner_subject = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![owner.as_str()], row_to_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a conversation and, via schema cascade, its messages.
    /// Owner or admin. Analytics rows referencing the id are not touched —
    /// they live in a separate store.
    #[instrument(skip(self), fields(id = %id, requester = %requester))]
    pub fn delete_conversation(
        &self,
        id: &ConversationId,
        requester: &Subject,
        role: UserRole,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let conversation = load_conversation(&db, id)?;
        authorize_read(&conversation.owner_subject, requester, role)?;

        db.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    /// Mark a conversation terminal. A write, so owner-only — admins do not
    /// impersonate for mutations.
    #[instrument(skip(self), fields(id = %id, requester = %requester))]
    pub fn end_conversation(&self, id: &ConversationId, requester: &Subject) -> Result<()> {
        let db = self.db.lock().unwrap();
        let conversation = load_conversation(&db, id)?;
        authorize_write(&conversation.owner_subject, requester)?;

        db.execute(
            "UPDATE conversations SET status = 'ended' WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    // ── messages ──────────────────────────────────────────────────────────

    /// Append a message. Fails with `Ended` when the conversation is
    /// terminal. The store generates id and created_at so per-conversation
    /// ordering stays monotonic.
    #[instrument(skip(self, new), fields(conversation = %conversation_id, role = %new.role))]
    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        new: NewMessage,
    ) -> Result<Message> {
        let db = self.db.lock().unwrap();
        let conversation = load_conversation(&db, conversation_id)?;
        if conversation.status == ConversationStatus::Ended {
            return Err(StoreError::Ended {
                id: conversation_id.as_str().to_string(),
            });
        }

        let message = Message {
            id: convoai_core::types::MessageId::new(),
            conversation_id: conversation_id.clone(),
            role: new.role,
            content: new.content,
            token_count: new.token_count,
            response_time_ms: new.response_time_ms,
            model_name: new.model_name,
            created_at: Utc::now().to_rfc3339(),
        };
        db.execute(
            "INSERT INTO messages
                (id, conversation_id, role, content, token_count, response_time_ms, model_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.as_str(),
                message.conversation_id.as_str(),
                message.role.to_string(),
                message.content,
                message.token_count,
                message.response_time_ms,
                message.model_name,
                message.created_at,
            ],
        )?;
        Ok(message)
    }

    /// Full ordered history, oldest first. Read-authorized.
    #[instrument(skip(self), fields(conversation = %conversation_id, requester = %requester))]
    pub fn list_messages(
        &self,
        conversation_id: &ConversationId,
        requester: &Subject,
        role: UserRole,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let conversation = load_conversation(&db, conversation_id)?;
        authorize_read(&conversation.owner_subject, requester, role)?;
        query_messages(
            &db,
            "SELECT id, conversation_id, role, content, token_count, response_time_ms, model_name, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC",
            conversation_id,
        )
    }

    /// The last `limit` messages in chronological order — the pipeline's
    /// context window. No authorization: only the pipeline calls this, after
    /// the gateway has already authorized the session.
    pub fn recent_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, token_count, response_time_ms, model_name, created_at
             FROM (SELECT * FROM messages WHERE conversation_id = ?1
                   ORDER BY created_at DESC LIMIT ?2)
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id.as_str(), limit as i64], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── tool-server registrations ─────────────────────────────────────────

    #[instrument(skip(self, endpoint_url), fields(owner = %owner, name))]
    pub fn create_tool_server(
        &self,
        owner: &Subject,
        name: &str,
        description: &str,
        endpoint_url: &str,
        enabled: bool,
    ) -> Result<ToolServerRegistration> {
        let registration = ToolServerRegistration {
            id: ServerId::new(),
            owner_subject: owner.clone(),
            name: name.to_string(),
            description: description.to_string(),
            endpoint_url: endpoint_url.to_string(),
            enabled,
            created_at: Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tool_servers (id, owner_subject, name, description, endpoint_url, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                registration.id.as_str(),
                registration.owner_subject.as_str(),
                registration.name,
                registration.description,
                registration.endpoint_url,
                registration.enabled as i32,
                registration.created_at,
            ],
        )?;
        Ok(registration)
    }

    #[instrument(skip(self), fields(id = %id, requester = %requester))]
    pub fn get_tool_server(
        &self,
        id: &ServerId,
        requester: &Subject,
        role: UserRole,
    ) -> Result<ToolServerRegistration> {
        let db = self.db.lock().unwrap();
        let registration = load_tool_server(&db, id)?;
        authorize_read(&registration.owner_subject, requester, role)?;
        Ok(registration)
    }

    /// Registrations owned by `owner`, in creation order — that order is
    /// what makes duplicate-tool-name disambiguation deterministic.
    #[instrument(skip(self), fields(owner = %owner, enabled_only))]
    pub fn list_tool_servers(
        &self,
        owner: &Subject,
        enabled_only: bool,
    ) -> Result<Vec<ToolServerRegistration>> {
        let db = self.db.lock().unwrap();
        let sql = if enabled_only {
            "SELECT id, owner_subject, name, description, endpoint_url, enabled, created_at
             FROM tool_servers WHERE owner_subject = ?1 AND enabled = 1
             ORDER BY created_at ASC"
        } else {
            "SELECT id, owner_subject, name, description, endpoint_url, enabled, created_at
             FROM tool_servers WHERE owner_subject = ?1
             ORDER BY created_at ASC"
        };
        let mut stmt = db.prepare(sql)?;
        let rows = stmt
            .query_map(params![owner.as_str()], row_to_tool_server)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Update mutable fields. Owner-only: registration writes never get the
    /// admin bypass.
    #[instrument(skip(self, endpoint_url), fields(id = %id, requester = %requester))]
    pub fn update_tool_server(
        &self,
        id: &ServerId,
        requester: &Subject,
        name: &str,
        description: &str,
        endpoint_url: &str,
        enabled: bool,
    ) -> Result<ToolServerRegistration> {
        let db = self.db.lock().unwrap();
        let registration = load_tool_server(&db, id)?;
        authorize_write(&registration.owner_subject, requester)?;

        db.execute(
            "UPDATE tool_servers
             SET name = ?2, description = ?3, endpoint_url = ?4, enabled = ?5
             WHERE id = ?1",
            params![
                id.as_str(),
                name,
                description,
                endpoint_url,
                enabled as i32
            ],
        )?;
        load_tool_server(&db, id)
    }

    #[instrument(skip(self), fields(id = %id, requester = %requester))]
    pub fn delete_tool_server(
        &self,
        id: &ServerId,
        requester: &Subject,
        role: UserRole,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let registration = load_tool_server(&db, id)?;
        authorize_read(&registration.owner_subject, requester, role)?;

        db.execute(
            "DELETE FROM tool_servers WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }
}

// ── authorization predicates ──────────────────────────────────────────────

fn authorize_read(owner: &Subject, requester: &Subject, role: UserRole) -> Result<()> {
    if requester == owner || role.is_admin() {
        Ok(())
    } else {
        Err(StoreError::Forbidden {
            reason: format!("{} is not the owner", requester),
        })
    }
}

fn authorize_write(owner: &Subject, requester: &Subject) -> Result<()> {
    if requester == owner {
        Ok(())
    } else {
        Err(StoreError::Forbidden {
            reason: format!("{} is not the owner", requester),
        })
    }
}

// ── row mappers and private queries ───────────────────────────────────────

fn load_conversation(db: &Connection, id: &ConversationId) -> Result<Conversation> {
    match db.query_row(
        "SELECT id, owner_subject, title, system_prompt, status, created_at
         FROM conversations WHERE id = ?1",
        params![id.as_str()],
        row_to_conversation,
    ) {
        Ok(c) => Ok(c),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound {
            what: "conversation",
            id: id.as_str().to_string(),
        }),
        Err(e) => Err(StoreError::Database(e)),
    }
}

fn load_tool_server(db: &Connection, id: &ServerId) -> Result<ToolServerRegistration> {
    match db.query_row(
        "SELECT id, owner_subject, name, description, endpoint_url, enabled, created_at
         FROM tool_servers WHERE id = ?1",
        params![id.as_str()],
        row_to_tool_server,
    ) {
        Ok(r) => Ok(r),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound {
            what: "tool server",
            id: id.as_str().to_string(),
        }),
        Err(e) => Err(StoreError::Database(e)),
    }
}

fn query_messages(
    db: &Connection,
    sql: &str,
    conversation_id: &ConversationId,
) -> Result<Vec<Message>> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt
        .query_map(params![conversation_id.as_str()], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status = ConversationStatus::from_str(&row.get::<_, String>(4)?)
        .unwrap_or(ConversationStatus::Active);
    Ok(Conversation {
        id: ConversationId::from(row.get::<_, String>(0)?),
        owner_subject: Subject::from(row.get::<_, String>(1)?),
        title: row.get(2)?,
        system_prompt: row.get(3)?,
        status,
        created_at: row.get(5)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role = MessageRole::from_str(&row.get::<_, String>(2)?).unwrap_or(MessageRole::User);
    Ok(Message {
        id: convoai_core::types::MessageId(row.get(0)?),
        conversation_id: ConversationId::from(row.get::<_, String>(1)?),
        role,
        content: row.get(3)?,
        token_count: row.get(4)?,
        response_time_ms: row.get(5)?,
        model_name: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_tool_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolServerRegistration> {
    Ok(ToolServerRegistration {
        id: ServerId::from(row.get::<_, String>(0)?),
        owner_subject: Subject::from(row.get::<_, String>(1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        endpoint_url: row.get(4)?,
        enabled: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn manager() -> StoreManager {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        StoreManager::new(conn)
    }

    fn alice() -> Subject {
        Subject::from("alice")
    }

    fn bob() -> Subject {
        Subject::from("bob")
    }

    #[test]
    fn owner_reads_own_conversation() {
        let store = manager();
        let c = store
            .create_conversation(&alice(), "greetings", None)
            .unwrap();
        let fetched = store
            .get_conversation(&c.id, &alice(), UserRole::User)
            .unwrap();
        assert_eq!(fetched.owner_subject, alice());
        assert_eq!(fetched.status, ConversationStatus::Active);
    }

    #[test]
    fn stranger_is_forbidden_admin_is_not() {
        let store = manager();
        let c = store.create_conversation(&alice(), "private", None).unwrap();

        let err = store
            .get_conversation(&c.id, &bob(), UserRole::User)
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden { .. }));

        assert!(store.get_conversation(&c.id, &bob(), UserRole::Admin).is_ok());
    }

    #[test]
    fn admin_bypass_does_not_extend_to_writes() {
        let store = manager();
        let c = store.create_conversation(&alice(), "private", None).unwrap();

        let err = store.end_conversation(&c.id, &bob()).unwrap_err();
        assert!(matches!(err, StoreError::Forbidden { .. }));
    }

    #[test]
    fn unknown_conversation_is_not_found() {
        let store = manager();
        let err = store
            .get_conversation(&ConversationId::from("missing"), &alice(), UserRole::User)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn ended_conversation_rejects_appends() {
        let store = manager();
        let c = store.create_conversation(&alice(), "done", None).unwrap();
        store.end_conversation(&c.id, &alice()).unwrap();

        let err = store
            .append_message(&c.id, NewMessage::text(MessageRole::User, "hello?"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Ended { .. }));
    }

    #[test]
    fn messages_are_ordered_and_cascade_on_delete() {
        let store = manager();
        let c = store.create_conversation(&alice(), "chat", None).unwrap();

        store
            .append_message(&c.id, NewMessage::text(MessageRole::User, "first"))
            .unwrap();
        store
            .append_message(&c.id, NewMessage::text(MessageRole::Assistant, "second"))
            .unwrap();

        let messages = store
            .list_messages(&c.id, &alice(), UserRole::User)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");

        store
            .delete_conversation(&c.id, &alice(), UserRole::User)
            .unwrap();
        let err = store
            .list_messages(&c.id, &alice(), UserRole::User)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn recent_messages_returns_tail_in_chronological_order() {
        let store = manager();
        let c = store.create_conversation(&alice(), "long", None).unwrap();
        for i in 0..5 {
            store
                .append_message(&c.id, NewMessage::text(MessageRole::User, format!("m{}", i)))
                .unwrap();
        }

        let tail = store.recent_messages(&c.id, 3).unwrap();
        let contents: Vec<_> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn assistant_metadata_round_trips() {
        let store = manager();
        let c = store.create_conversation(&alice(), "meta", None).unwrap();
        let m = store
            .append_message(
                &c.id,
                NewMessage {
                    role: MessageRole::Assistant,
                    content: "hi alice".to_string(),
                    token_count: Some(3),
                    response_time_ms: Some(1234),
                    model_name: Some("gpt-4o".to_string()),
                },
            )
            .unwrap();

        let messages = store
            .list_messages(&c.id, &alice(), UserRole::User)
            .unwrap();
        assert_eq!(messages[0].id, m.id);
        assert_eq!(messages[0].token_count, Some(3));
        assert_eq!(messages[0].response_time_ms, Some(1234));
    }

    #[test]
    fn tool_server_crud_is_owner_scoped() {
        let store = manager();
        let reg = store
            .create_tool_server(&alice(), "clock", "time tools", "http://127.0.0.1:9000", true)
            .unwrap();

        let err = store
            .get_tool_server(&reg.id, &bob(), UserRole::User)
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden { .. }));

        let err = store
            .update_tool_server(&reg.id, &bob(), "clock", "", "http://evil", true)
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden { .. }));

        // admin may read and delete, never write
        assert!(store.get_tool_server(&reg.id, &bob(), UserRole::Admin).is_ok());
        store
            .delete_tool_server(&reg.id, &bob(), UserRole::Admin)
            .unwrap();
    }

    #[test]
    fn enabled_only_listing_filters_disabled_servers() {
        let store = manager();
        store
            .create_tool_server(&alice(), "a", "", "http://a", true)
            .unwrap();
        store
            .create_tool_server(&alice(), "b", "", "http://b", false)
            .unwrap();

        let all = store.list_tool_servers(&alice(), false).unwrap();
        let enabled = store.list_tool_servers(&alice(), true).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");
    }
}
