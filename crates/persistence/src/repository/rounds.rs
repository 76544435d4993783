//! Game rounds repository: the outcome history each channel is analyzed from

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted game round
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GameRoundRecord {
    pub id: Option<i64>,
    pub channel_id: i64,
    pub round_id: String,
    pub max_multiplier: f64,
    pub bets_count: Option<i64>,
    pub total_bet_amount: Option<f64>,
    pub online_players: Option<i64>,
    pub total_cashout: Option<f64>,
    pub casino_profit: Option<f64>,
    pub loss_percentage: Option<f64>,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl GameRoundRecord {
    /// A round with only the fields the engine reads
    pub fn new(channel_id: i64, round_id: impl Into<String>, max_multiplier: f64, timestamp: i64) -> Self {
        Self {
            id: None,
            channel_id,
            round_id: round_id.into(),
            max_multiplier,
            bets_count: None,
            total_bet_amount: None,
            online_players: None,
            total_cashout: None,
            casino_profit: None,
            loss_percentage: None,
            timestamp,
        }
    }
}

/// Repository for game rounds
pub struct RoundRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RoundRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a round, returning its row id
    pub async fn add_round(&self, round: &GameRoundRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO game_rounds
                (channel_id, round_id, max_multiplier, bets_count, total_bet_amount,
                 online_players, total_cashout, casino_profit, loss_percentage, timestamp)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(round.channel_id)
        .bind(&round.round_id)
        .bind(round.max_multiplier)
        .bind(round.bets_count)
        .bind(round.total_bet_amount)
        .bind(round.online_players)
        .bind(round.total_cashout)
        .bind(round.casino_profit)
        .bind(round.loss_percentage)
        .bind(round.timestamp)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent rounds for a channel, newest first.
    /// May contain the same round_id more than once if the feed delivered it twice.
    pub async fn get_last_results(&self, channel_id: i64, limit: i64) -> DbResult<Vec<GameRoundRecord>> {
        let records = sqlx::query_as::<_, GameRoundRecord>(
            r#"SELECT * FROM game_rounds
               WHERE channel_id = ?1
               ORDER BY timestamp DESC, id DESC
               LIMIT ?2"#,
        )
        .bind(channel_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Every round for a channel, newest first
    pub async fn find_by_channel(&self, channel_id: i64) -> DbResult<Vec<GameRoundRecord>> {
        let records = sqlx::query_as::<_, GameRoundRecord>(
            "SELECT * FROM game_rounds WHERE channel_id = ?1 ORDER BY timestamp DESC, id DESC",
        )
        .bind(channel_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
