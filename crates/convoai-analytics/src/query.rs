//! Role-gated read surface over the analytics store.
//!
//! Authorization happens at the HTTP layer (admin bearer token); these
//! methods only know how to aggregate.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::instrument;

use crate::error::Result;
use crate::events::{Activity, ConversationRollup};
use crate::ingest::AnalyticsManager;

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_users: i64,
    pub active_users_today: i64,
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_tokens: i64,
    pub avg_response_time_s: f64,
    /// Share of management-API calls that returned a 4xx/5xx status.
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopUser {
    pub subject: String,
    pub message_count: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub subject: Option<String>,
    pub kind: Option<String>,
}

impl AnalyticsManager {
    #[instrument(skip(self))]
    pub fn summary(&self) -> Result<Summary> {
        let db = self.lock_db();

        let total_users: i64 = db.query_row(
            "SELECT COUNT(DISTINCT subject) FROM message_metrics",
            [],
            |row| row.get(0),
        )?;

        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().to_rfc3339())
            .unwrap_or_default();
        let active_users_today: i64 = db.query_row(
            "SELECT COUNT(DISTINCT subject) FROM activities WHERE timestamp >= ?1",
            params![midnight],
            |row| row.get(0),
        )?;

        let (total_conversations, total_messages, total_tokens, weighted_sum, assistant_total): (
            i64,
            i64,
            i64,
            f64,
            i64,
        ) = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(message_count), 0),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(avg_response_time_s * assistant_count), 0),
                    COALESCE(SUM(assistant_count), 0)
             FROM conversation_rollups",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;
        let avg_response_time_s = if assistant_total > 0 {
            weighted_sum / assistant_total as f64
        } else {
            0.0
        };

        let (calls, errors): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status >= 400 THEN 1 ELSE 0 END), 0)
             FROM api_calls",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let error_rate = if calls > 0 {
            errors as f64 / calls as f64
        } else {
            0.0
        };

        Ok(Summary {
            total_users,
            active_users_today,
            total_conversations,
            total_messages,
            total_tokens,
            avg_response_time_s,
            error_rate,
        })
    }

    #[instrument(skip(self))]
    pub fn top_users(&self, limit: usize) -> Result<Vec<TopUser>> {
        let db = self.lock_db();
        let mut stmt = db.prepare(
            "SELECT subject, COUNT(*), COALESCE(SUM(COALESCE(token_count, 0)), 0)
             FROM message_metrics
             GROUP BY subject
             ORDER BY 3 DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(TopUser {
                    subject: row.get(0)?,
                    message_count: row.get(1)?,
                    total_tokens: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[instrument(skip(self, filter))]
    pub fn user_activities(
        &self,
        filter: &ActivityFilter,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Activity>> {
        let db = self.lock_db();
        let mut stmt = db.prepare(
            "SELECT subject, kind, metadata, timestamp
             FROM activities
             WHERE (?1 IS NULL OR subject = ?1)
               AND (?2 IS NULL OR kind = ?2)
             ORDER BY timestamp DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt
            .query_map(
                params![filter.subject, filter.kind, limit as i64, skip as i64],
                |row| {
                    let metadata: Option<String> = row.get(2)?;
                    Ok(Activity {
                        subject: row.get(0)?,
                        kind: row.get(1)?,
                        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                        timestamp: row.get(3)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn conversation_rollup(&self, conversation_id: &str) -> Result<ConversationRollup> {
        self.get_rollup(conversation_id)
    }

    /// Destructive reset of every analytics table. The HTTP layer gates this
    /// behind a token-verified admin role.
    #[instrument(skip(self))]
    pub fn clear_all(&self) -> Result<()> {
        let db = self.lock_db();
        db.execute_batch(
            "DELETE FROM activities;
             DELETE FROM api_calls;
             DELETE FROM message_metrics;
             DELETE FROM conversation_rollups;",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::events::MessageMetric;
    use rusqlite::Connection;

    fn manager() -> AnalyticsManager {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        AnalyticsManager::new(conn)
    }

    fn metric(subject: &str, conversation: &str, role: &str, tokens: u32) -> MessageMetric {
        MessageMetric {
            message_id: uuid::Uuid::now_v7().to_string(),
            conversation_id: conversation.to_string(),
            subject: subject.to_string(),
            role: role.to_string(),
            token_count: Some(tokens),
            response_time_s: if role == "assistant" { Some(2.0) } else { None },
            model_name: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn summary_aggregates_across_conversations() {
        let analytics = manager();
        analytics
            .record_message_metric(&metric("alice", "c1", "assistant", 10))
            .unwrap();
        analytics
            .record_message_metric(&metric("bob", "c2", "assistant", 30))
            .unwrap();
        analytics
            .record_message_metric(&metric("bob", "c2", "user", 0))
            .unwrap();

        let summary = analytics.summary().unwrap();
        assert_eq!(summary.total_users, 2);
        assert_eq!(summary.total_conversations, 2);
        assert_eq!(summary.total_messages, 3);
        assert_eq!(summary.total_tokens, 40);
        assert!((summary.avg_response_time_s - 2.0).abs() < 1e-9);
        assert_eq!(summary.error_rate, 0.0);
    }

    #[test]
    fn top_users_orders_by_tokens() {
        let analytics = manager();
        analytics
            .record_message_metric(&metric("alice", "c1", "assistant", 5))
            .unwrap();
        analytics
            .record_message_metric(&metric("bob", "c2", "assistant", 50))
            .unwrap();

        let top = analytics.top_users(10).unwrap();
        assert_eq!(top[0].subject, "bob");
        assert_eq!(top[0].total_tokens, 50);
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn activity_filter_narrows_results() {
        let analytics = manager();
        for (subject, kind) in [("alice", "login"), ("alice", "logout"), ("bob", "login")] {
            analytics
                .record_activity(&crate::events::Activity {
                    subject: subject.to_string(),
                    kind: kind.to_string(),
                    metadata: None,
                    timestamp: Utc::now().to_rfc3339(),
                })
                .unwrap();
        }

        let filter = ActivityFilter {
            subject: Some("alice".to_string()),
            kind: Some("login".to_string()),
        };
        let rows = analytics.user_activities(&filter, 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject, "alice");
    }

    #[test]
    fn clear_all_empties_every_table() {
        let analytics = manager();
        analytics
            .record_message_metric(&metric("alice", "c1", "assistant", 5))
            .unwrap();
        analytics.clear_all().unwrap();

        let summary = analytics.summary().unwrap();
        assert_eq!(summary.total_users, 0);
        assert_eq!(summary.total_conversations, 0);
    }
}
