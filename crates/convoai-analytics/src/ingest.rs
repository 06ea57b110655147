use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::error::{AnalyticsError, Result};
use crate::events::{Activity, ApiCall, ConversationLifecycle, ConversationRollup, MessageMetric};

/// Owner of the analytics store.
///
/// Wraps a single SQLite connection in a `Mutex`; every rollup upsert runs
/// as one transaction under that lock, so concurrent `MessageMetric` events
/// for the same conversation serialize and the weighted mean cannot drift.
pub struct AnalyticsManager {
    db: Mutex<Connection>,
}

impl AnalyticsManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub(crate) fn lock_db(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap()
    }

    #[instrument(skip(self, event), fields(subject = %event.subject, kind = %event.kind))]
    pub fn record_activity(&self, event: &Activity) -> Result<()> {
        let metadata = event
            .metadata
            .as_ref()
            .map(|m| m.to_string());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO activities (subject, kind, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.subject, event.kind, metadata, event.timestamp],
        )?;
        Ok(())
    }

    #[instrument(skip(self, event), fields(endpoint = %event.endpoint, status = event.status))]
    pub fn record_api_call(&self, event: &ApiCall) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO api_calls (endpoint, method, subject, status, latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.endpoint,
                event.method,
                event.subject,
                event.status,
                event.latency_ms,
                event.timestamp
            ],
        )?;
        Ok(())
    }

    /// Lifecycle events land in the activity log; a deletion additionally
    /// drops the conversation's rollup. Its message metrics stay — they are
    /// immutable audit data.
    #[instrument(skip(self, event), fields(conversation = %event.conversation_id, action = %event.action))]
    pub fn record_lifecycle(&self, event: &ConversationLifecycle) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO activities (subject, kind, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.subject,
                format!("conversation_{}", event.action),
                serde_json::json!({ "conversation_id": event.conversation_id }).to_string(),
                event.timestamp
            ],
        )?;
        if event.action == crate::events::LifecycleAction::Deleted {
            db.execute(
                "DELETE FROM conversation_rollups WHERE conversation_id = ?1",
                params![event.conversation_id],
            )?;
        }
        Ok(())
    }

    /// Append the metric and upsert the conversation rollup, atomically.
    ///
    /// Update rules: every metric bumps `message_count` and adds its token
    /// count (absent counts as 0); only assistant metrics with a positive
    /// response time move the running mean, divided by `assistant_count`.
    #[instrument(skip(self, metric), fields(conversation = %metric.conversation_id, role = %metric.role))]
    pub fn record_message_metric(&self, metric: &MessageMetric) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        tx.execute(
            "INSERT INTO message_metrics
                (message_id, conversation_id, subject, role, token_count, response_time_s, model_name, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metric.message_id,
                metric.conversation_id,
                metric.subject,
                metric.role,
                metric.token_count,
                metric.response_time_s,
                metric.model_name,
                metric.timestamp
            ],
        )?;

        let existing = tx
            .query_row(
                "SELECT message_count, total_tokens, avg_response_time_s, assistant_count
                 FROM conversation_rollups WHERE conversation_id = ?1",
                params![metric.conversation_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let tokens = metric.token_count.unwrap_or(0) as i64;
        let timed_assistant = metric.role == "assistant"
            && metric.response_time_s.map(|s| s > 0.0).unwrap_or(false);
        let now = Utc::now().to_rfc3339();

        match existing {
            Some((message_count, total_tokens, avg, assistant_count)) => {
                let (new_avg, new_assistant_count) = if timed_assistant {
                    let rt = metric.response_time_s.unwrap_or(0.0);
                    if assistant_count == 0 {
                        (rt, 1)
                    } else {
                        (
                            (avg * assistant_count as f64 + rt) / (assistant_count as f64 + 1.0),
                            assistant_count + 1,
                        )
                    }
                } else {
                    (avg, assistant_count)
                };
                tx.execute(
                    "UPDATE conversation_rollups
                     SET message_count = ?2, total_tokens = ?3,
                         avg_response_time_s = ?4, assistant_count = ?5, updated_at = ?6
                     WHERE conversation_id = ?1",
                    params![
                        metric.conversation_id,
                        message_count + 1,
                        total_tokens + tokens,
                        new_avg,
                        new_assistant_count,
                        now
                    ],
                )?;
            }
            None => {
                let (avg, assistant_count) = if timed_assistant {
                    (metric.response_time_s.unwrap_or(0.0), 1)
                } else {
                    (0.0, 0)
                };
                tx.execute(
                    "INSERT INTO conversation_rollups
                        (conversation_id, owner_subject, message_count, total_tokens,
                         avg_response_time_s, assistant_count, updated_at)
                     VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)",
                    params![
                        metric.conversation_id,
                        metric.subject,
                        tokens,
                        avg,
                        assistant_count,
                        now
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_rollup(&self, conversation_id: &str) -> Result<ConversationRollup> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT conversation_id, owner_subject, message_count, total_tokens,
                    avg_response_time_s, assistant_count, updated_at
             FROM conversation_rollups WHERE conversation_id = ?1",
            params![conversation_id],
            row_to_rollup,
        )
        .optional()?
        .ok_or_else(|| AnalyticsError::RollupNotFound {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Recompute one rollup from its metrics alone — the repair path, and
    /// the proof that rollups are derived state.
    #[instrument(skip(self))]
    pub fn rebuild_rollup(&self, conversation_id: &str) -> Result<ConversationRollup> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let (message_count, total_tokens, owner): (i64, i64, Option<String>) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(COALESCE(token_count, 0)), 0), MIN(subject)
             FROM message_metrics WHERE conversation_id = ?1",
            params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let owner = owner.ok_or_else(|| AnalyticsError::RollupNotFound {
            conversation_id: conversation_id.to_string(),
        })?;

        let (assistant_count, avg): (i64, f64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(AVG(response_time_s), 0)
             FROM message_metrics
             WHERE conversation_id = ?1 AND role = 'assistant'
               AND response_time_s IS NOT NULL AND response_time_s > 0",
            params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO conversation_rollups
                (conversation_id, owner_subject, message_count, total_tokens,
                 avg_response_time_s, assistant_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(conversation_id) DO UPDATE SET
                owner_subject = ?2, message_count = ?3, total_tokens = ?4,
                avg_response_time_s = ?5, assistant_count = ?6, updated_at = ?7",
            params![
                conversation_id,
                owner,
                message_count,
                total_tokens,
                avg,
                assistant_count,
                now
            ],
        )?;
        tx.commit()?;
        drop(db);

        self.get_rollup(conversation_id)
    }
}

pub(crate) fn row_to_rollup(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRollup> {
    Ok(ConversationRollup {
        conversation_id: row.get(0)?,
        owner_subject: row.get(1)?,
        message_count: row.get(2)?,
        total_tokens: row.get(3)?,
        avg_response_time_s: row.get(4)?,
        assistant_count: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use std::sync::Arc;

    fn manager() -> AnalyticsManager {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        AnalyticsManager::new(conn)
    }

    fn assistant_metric(conversation: &str, seconds: f64, tokens: u32) -> MessageMetric {
        MessageMetric {
            message_id: uuid::Uuid::now_v7().to_string(),
            conversation_id: conversation.to_string(),
            subject: "alice".to_string(),
            role: "assistant".to_string(),
            token_count: Some(tokens),
            response_time_s: Some(seconds),
            model_name: Some("gpt-4o".to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn user_metric(conversation: &str) -> MessageMetric {
        MessageMetric {
            message_id: uuid::Uuid::now_v7().to_string(),
            conversation_id: conversation.to_string(),
            subject: "alice".to_string(),
            role: "user".to_string(),
            token_count: None,
            response_time_s: None,
            model_name: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn weighted_average_matches_the_contract() {
        let analytics = manager();
        analytics
            .record_message_metric(&assistant_metric("c3", 2.0, 10))
            .unwrap();
        analytics
            .record_message_metric(&assistant_metric("c3", 4.0, 10))
            .unwrap();

        let rollup = analytics.get_rollup("c3").unwrap();
        assert_eq!(rollup.assistant_count, 2);
        assert!((rollup.avg_response_time_s - 3.0).abs() < 1e-9);

        analytics
            .record_message_metric(&assistant_metric("c3", 6.0, 10))
            .unwrap();
        let rollup = analytics.get_rollup("c3").unwrap();
        assert!((rollup.avg_response_time_s - 4.0).abs() < 1e-9);
        assert_eq!(rollup.message_count, 3);
        assert_eq!(rollup.total_tokens, 30);
    }

    #[test]
    fn user_metrics_count_messages_but_not_the_average() {
        let analytics = manager();
        analytics
            .record_message_metric(&assistant_metric("c1", 2.0, 5))
            .unwrap();
        analytics.record_message_metric(&user_metric("c1")).unwrap();

        let rollup = analytics.get_rollup("c1").unwrap();
        assert_eq!(rollup.message_count, 2);
        assert_eq!(rollup.assistant_count, 1);
        assert!((rollup.avg_response_time_s - 2.0).abs() < 1e-9);
        // absent token_count treated as 0
        assert_eq!(rollup.total_tokens, 5);
    }

    #[test]
    fn concurrent_metrics_never_lose_an_update() {
        let analytics = Arc::new(manager());
        let mut handles = Vec::new();
        for i in 0..8 {
            let analytics = Arc::clone(&analytics);
            handles.push(std::thread::spawn(move || {
                analytics
                    .record_message_metric(&assistant_metric("race", (i + 1) as f64, 1))
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let rollup = analytics.get_rollup("race").unwrap();
        assert_eq!(rollup.message_count, 8);
        assert_eq!(rollup.assistant_count, 8);
        // mean of 1..=8 regardless of arrival order
        assert!((rollup.avg_response_time_s - 4.5).abs() < 1e-9);
    }

    #[test]
    fn rebuild_reproduces_the_incremental_rollup() {
        let analytics = manager();
        analytics
            .record_message_metric(&assistant_metric("c9", 1.5, 7))
            .unwrap();
        analytics.record_message_metric(&user_metric("c9")).unwrap();
        analytics
            .record_message_metric(&assistant_metric("c9", 3.5, 3))
            .unwrap();

        let incremental = analytics.get_rollup("c9").unwrap();
        let rebuilt = analytics.rebuild_rollup("c9").unwrap();

        assert_eq!(rebuilt.message_count, incremental.message_count);
        assert_eq!(rebuilt.total_tokens, incremental.total_tokens);
        assert_eq!(rebuilt.assistant_count, incremental.assistant_count);
        assert!((rebuilt.avg_response_time_s - incremental.avg_response_time_s).abs() < 1e-9);
    }

    #[test]
    fn deleting_a_conversation_keeps_its_metrics() {
        let analytics = manager();
        analytics
            .record_message_metric(&assistant_metric("gone", 1.0, 2))
            .unwrap();
        analytics
            .record_lifecycle(&ConversationLifecycle {
                conversation_id: "gone".to_string(),
                subject: "alice".to_string(),
                action: crate::events::LifecycleAction::Deleted,
                timestamp: Utc::now().to_rfc3339(),
            })
            .unwrap();

        assert!(matches!(
            analytics.get_rollup("gone"),
            Err(AnalyticsError::RollupNotFound { .. })
        ));
        // metrics survive: rebuild can resurrect the rollup from them
        let rebuilt = analytics.rebuild_rollup("gone").unwrap();
        assert_eq!(rebuilt.message_count, 1);
    }
}
