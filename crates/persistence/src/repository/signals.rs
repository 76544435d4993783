//! Signals repository: emitted signals and their verification attempts

use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const STATUS_PENDING_FIRST: &str = "pending_first";
pub const STATUS_PENDING_GALE: &str = "pending_gale";
pub const STATUS_WON: &str = "won";
pub const STATUS_LOST: &str = "lost";

/// A persisted signal row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SignalRecord {
    pub id: i64,
    pub channel_id: i64,
    /// JSON array of the multipliers that triggered the signal
    pub pattern_json: String,
    pub created_at: i64,
    pub first_attempt_result: Option<f64>,
    pub first_attempt_round_id: Option<String>,
    pub second_attempt_result: Option<f64>,
    pub second_attempt_round_id: Option<String>,
    pub status: String,
    pub closed_at: Option<i64>,
}

impl SignalRecord {
    pub fn pattern(&self) -> DbResult<Vec<f64>> {
        serde_json::from_str(&self.pattern_json)
            .map_err(|e| DbError::Query(format!("signal {} has malformed pattern: {e}", self.id)))
    }
}

/// Aggregated win/loss bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalStats {
    pub total: i64,
    pub open: i64,
    pub won: i64,
    pub lost: i64,
    pub won_first_attempt: i64,
    pub won_with_gale: i64,
    /// won / (won + lost) as a percentage, 0 when nothing has closed
    pub win_rate: f64,
}

fn is_terminal(status: &str) -> bool {
    status == STATUS_WON || status == STATUS_LOST
}

/// Repository for signals
pub struct SignalRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SignalRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new signal in `pending_first` and return the stored row
    pub async fn create(&self, channel_id: i64, pattern: &[f64], created_at: i64) -> DbResult<SignalRecord> {
        let pattern_json = serde_json::to_string(pattern)
            .map_err(|e| DbError::Query(format!("failed to encode pattern: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO signals (channel_id, pattern_json, created_at, status) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(channel_id)
        .bind(&pattern_json)
        .bind(created_at)
        .bind(STATUS_PENDING_FIRST)
        .execute(self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::Query(format!("signal {id} missing right after insert")))
    }

    pub async fn get_by_id(&self, id: i64) -> DbResult<Option<SignalRecord>> {
        let record = sqlx::query_as::<_, SignalRecord>("SELECT * FROM signals WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Record the first verification round. `closed_at` is stamped when `status` is terminal.
    pub async fn update_first_attempt(
        &self,
        id: i64,
        result: f64,
        round_id: &str,
        status: &str,
        now: i64,
    ) -> DbResult<()> {
        let closed_at = is_terminal(status).then_some(now);
        let updated = sqlx::query(
            r#"UPDATE signals
               SET first_attempt_result = ?1, first_attempt_round_id = ?2, status = ?3, closed_at = ?4
               WHERE id = ?5"#,
        )
        .bind(result)
        .bind(round_id)
        .bind(status)
        .bind(closed_at)
        .bind(id)
        .execute(self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::Query(format!("signal {id} not found")));
        }
        Ok(())
    }

    /// Record the gale round. Always terminal.
    pub async fn update_second_attempt(
        &self,
        id: i64,
        result: f64,
        round_id: &str,
        status: &str,
        now: i64,
    ) -> DbResult<()> {
        let updated = sqlx::query(
            r#"UPDATE signals
               SET second_attempt_result = ?1, second_attempt_round_id = ?2, status = ?3, closed_at = ?4
               WHERE id = ?5"#,
        )
        .bind(result)
        .bind(round_id)
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::Query(format!("signal {id} not found")));
        }
        Ok(())
    }

    /// Open signals for one channel, newest first
    pub async fn get_pending(&self, channel_id: i64) -> DbResult<Vec<SignalRecord>> {
        let records = sqlx::query_as::<_, SignalRecord>(
            r#"SELECT * FROM signals
               WHERE channel_id = ?1 AND status IN (?2, ?3)
               ORDER BY created_at DESC, id DESC"#,
        )
        .bind(channel_id)
        .bind(STATUS_PENDING_FIRST)
        .bind(STATUS_PENDING_GALE)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Open signals across all channels, newest first
    pub async fn get_all_pending(&self) -> DbResult<Vec<SignalRecord>> {
        let records = sqlx::query_as::<_, SignalRecord>(
            r#"SELECT * FROM signals
               WHERE status IN (?1, ?2)
               ORDER BY created_at DESC, id DESC"#,
        )
        .bind(STATUS_PENDING_FIRST)
        .bind(STATUS_PENDING_GALE)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Latest signals, optionally restricted to one channel
    pub async fn get_recent(&self, channel_id: Option<i64>, limit: i64) -> DbResult<Vec<SignalRecord>> {
        let records = match channel_id {
            Some(channel) => {
                sqlx::query_as::<_, SignalRecord>(
                    "SELECT * FROM signals WHERE channel_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                )
                .bind(channel)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SignalRecord>(
                    "SELECT * FROM signals ORDER BY created_at DESC, id DESC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
        };

        Ok(records)
    }

    pub async fn get_stats(&self, channel_id: Option<i64>) -> DbResult<SignalStats> {
        let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                 COUNT(*),
                 COALESCE(SUM(CASE WHEN status IN ('pending_first', 'pending_gale') THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'won' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'lost' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'won' AND second_attempt_result IS NULL THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'won' AND second_attempt_result IS NOT NULL THEN 1 ELSE 0 END), 0)
               FROM signals
               WHERE ?1 IS NULL OR channel_id = ?1"#,
        )
        .bind(channel_id)
        .fetch_one(self.pool)
        .await?;

        let (total, open, won, lost, won_first_attempt, won_with_gale) = row;
        let closed = won + lost;
        let win_rate = if closed > 0 {
            won as f64 / closed as f64 * 100.0
        } else {
            0.0
        };

        Ok(SignalStats {
            total,
            open,
            won,
            lost,
            won_first_attempt,
            won_with_gale,
            win_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_create_starts_pending_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let signal = repo.create(3, &[1.6, 1.7, 1.9], 42).await.unwrap();
        assert_eq!(signal.channel_id, 3);
        assert_eq!(signal.status, STATUS_PENDING_FIRST);
        assert_eq!(signal.created_at, 42);
        assert_eq!(signal.pattern().unwrap(), vec![1.6, 1.7, 1.9]);
        assert!(signal.first_attempt_result.is_none());
        assert!(signal.closed_at.is_none());
    }

    #[tokio::test]
    async fn test_attempts_move_signal_out_of_pending() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let signal = repo.create(1, &[1.6, 1.7, 1.9], 10).await.unwrap();
        repo.update_first_attempt(signal.id, 1.2, "r1", STATUS_PENDING_GALE, 20)
            .await
            .unwrap();

        let pending = repo.get_pending(1).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, STATUS_PENDING_GALE);
        assert_eq!(pending[0].first_attempt_round_id.as_deref(), Some("r1"));
        assert!(pending[0].closed_at.is_none());

        repo.update_second_attempt(signal.id, 1.8, "r2", STATUS_WON, 30)
            .await
            .unwrap();
        assert!(repo.get_pending(1).await.unwrap().is_empty());

        let closed = repo.get_by_id(signal.id).await.unwrap().unwrap();
        assert_eq!(closed.status, STATUS_WON);
        assert_eq!(closed.second_attempt_result, Some(1.8));
        assert_eq!(closed.closed_at, Some(30));
    }

    #[tokio::test]
    async fn test_update_missing_signal_errors() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let err = repo
            .update_first_attempt(999, 2.0, "r", STATUS_WON, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query(_)));
    }

    #[tokio::test]
    async fn test_stats_split_first_attempt_and_gale_wins() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let a = repo.create(1, &[1.6], 1).await.unwrap();
        repo.update_first_attempt(a.id, 3.0, "a1", STATUS_WON, 2).await.unwrap();

        let b = repo.create(1, &[1.6], 3).await.unwrap();
        repo.update_first_attempt(b.id, 1.1, "b1", STATUS_PENDING_GALE, 4).await.unwrap();
        repo.update_second_attempt(b.id, 1.9, "b2", STATUS_WON, 5).await.unwrap();

        let c = repo.create(1, &[1.6], 6).await.unwrap();
        repo.update_first_attempt(c.id, 1.0, "c1", STATUS_PENDING_GALE, 7).await.unwrap();
        repo.update_second_attempt(c.id, 1.0, "c2", STATUS_LOST, 8).await.unwrap();

        repo.create(2, &[2.5], 9).await.unwrap();

        let stats = repo.get_stats(Some(1)).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.open, 0);
        assert_eq!(stats.won, 2);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.won_first_attempt, 1);
        assert_eq!(stats.won_with_gale, 1);
        assert!((stats.win_rate - 200.0 / 3.0).abs() < 1e-9);

        let all = repo.get_stats(None).await.unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.open, 1);
    }

    #[tokio::test]
    async fn test_stats_on_empty_table() {
        let db = Database::in_memory().await.unwrap();
        let stats = SignalRepository::new(db.pool()).get_stats(None).await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.win_rate, 0.0);
    }
}
