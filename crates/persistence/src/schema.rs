//! Database schema definitions

/// SQL to create all tables
/// NOTE: timestamps are unix milliseconds, multipliers are REAL
pub const CREATE_TABLES: &str = r#"
-- One row per observed game round
CREATE TABLE IF NOT EXISTS game_rounds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL,
    round_id TEXT NOT NULL,
    max_multiplier REAL NOT NULL,
    bets_count INTEGER,
    total_bet_amount REAL,
    online_players INTEGER,
    total_cashout REAL,
    casino_profit REAL,
    loss_percentage REAL,
    timestamp INTEGER NOT NULL
);

-- Advisory signals and their verification attempts
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL,
    pattern_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    first_attempt_result REAL,
    first_attempt_round_id TEXT,
    second_attempt_result REAL,
    second_attempt_round_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending_first'
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_rounds_channel_time ON game_rounds(channel_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_rounds_channel_round ON game_rounds(channel_id, round_id);
CREATE INDEX IF NOT EXISTS idx_signals_channel_status ON signals(channel_id, status);
CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at DESC)
"#;

/// Bookkeeping for `MIGRATIONS`, one row per applied name
pub const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    name TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
)";

/// Incremental changes applied after `CREATE_TABLES`, in order
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    name: "signals_closed_at",
    sql: "ALTER TABLE signals ADD COLUMN closed_at INTEGER",
}];

/// `CREATE_TABLES` split into executable statements, comment lines dropped
pub fn table_statements() -> impl Iterator<Item = String> {
    CREATE_TABLES.split(';').filter_map(|statement| {
        let sql = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let sql = sql.trim();
        (!sql.is_empty()).then(|| sql.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_statements_skip_comments_and_blanks() {
        let statements: Vec<_> = table_statements().collect();
        assert!(statements.iter().all(|s| !s.starts_with("--") && !s.is_empty()));
        assert!(statements.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS signals")));
        assert_eq!(statements.iter().filter(|s| s.starts_with("CREATE INDEX")).count(), 4);
    }

    #[test]
    fn test_migration_names_unique() {
        let mut names: Vec<_> = MIGRATIONS.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
    }
}
