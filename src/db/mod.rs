//! Durable state store.
//!
//! A single-connection SQLite pool with WAL journaling; the one connection
//! serializes all writes. Every mutation runs in its own transaction and
//! bumps `meta.updated_at`. A legacy JSON snapshot found at the database path
//! is imported once and the file renamed before the SQLite file is created.

use eyre::{Result as EyreResult, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub mod models;

use crate::error::Result;
use crate::types::{
    now_rfc3339, ClosureRecord, DisputeAttemptRecord, ObservedPipeRecord, RecordedEvent,
    SignatureStateRecord,
};
use models::{
    ClosureRow, DisputeAttemptRow, ObservedPipeRow, RecentEventRow, SignatureStateRow,
};

/// Legacy pre-SQLite snapshot layout.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySnapshot {
    #[serde(default)]
    closures: HashMap<String, ClosureRecord>,
    #[serde(default)]
    observed_pipes: HashMap<String, ObservedPipeRecord>,
    #[serde(default)]
    signature_states: HashMap<String, SignatureStateRecord>,
    #[serde(default)]
    dispute_attempts: HashMap<String, DisputeAttemptRecord>,
    #[serde(default)]
    recent_events: Vec<RecordedEvent>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCounts {
    pub closures: i64,
    pub observed_pipes: i64,
    pub signature_states: i64,
    pub dispute_attempts: i64,
    pub recent_events: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub closures: Vec<ClosureRecord>,
    pub observed_pipes: Vec<ObservedPipeRecord>,
    pub signature_states: Vec<SignatureStateRecord>,
    pub dispute_attempts: Vec<DisputeAttemptRecord>,
    pub recent_events: Vec<RecordedEvent>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    max_recent_events: u32,
}

impl Store {
    /// Open (or create) the database at `path`, importing a legacy JSON
    /// snapshot first if one sits there.
    pub async fn open(path: &Path, max_recent_events: u32) -> EyreResult<Self> {
        let legacy = read_legacy_snapshot(path)?;
        if legacy.is_some() {
            let backup = backup_path(path);
            std::fs::rename(path, &backup)
                .wrap_err_with(|| format!("failed to move legacy snapshot to {backup:?}"))?;
            info!(?backup, "legacy JSON state detected, migrating to SQLite");
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let store = Self::connect(options, max_recent_events).await?;

        if let Some(snapshot) = legacy {
            store
                .import_legacy(snapshot)
                .await
                .wrap_err("failed to import legacy JSON snapshot")?;
            info!("legacy snapshot imported");
        }
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(max_recent_events: u32) -> EyreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        Self::connect(options, max_recent_events).await
    }

    async fn connect(options: SqliteConnectOptions, max_recent_events: u32) -> EyreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .wrap_err("failed to open state database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .wrap_err("failed to run state database migrations")?;
        Ok(Self {
            pool,
            max_recent_events,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn touch_meta(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO meta (key, value) VALUES ('updated_at', ?1)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        )
        .bind(now_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ---- closures ----

    pub async fn upsert_closure(&self, record: &ClosureRecord) -> Result<()> {
        let pipe_key = serde_json::to_string(&record.pipe_key)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO closures (pipe_id, contract_id, pipe_key, closer, expires_at, nonce,
                   event_name, trigger_txid, block_height, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               ON CONFLICT(pipe_id) DO UPDATE SET
                   contract_id = excluded.contract_id,
                   pipe_key = excluded.pipe_key,
                   closer = excluded.closer,
                   expires_at = excluded.expires_at,
                   nonce = excluded.nonce,
                   event_name = excluded.event_name,
                   trigger_txid = excluded.trigger_txid,
                   block_height = excluded.block_height,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&record.pipe_id)
        .bind(&record.contract_id)
        .bind(&pipe_key)
        .bind(&record.closer)
        .bind(record.expires_at.map(|v| v as i64))
        .bind(&record.nonce)
        .bind(&record.event_name)
        .bind(&record.trigger_txid)
        .bind(record.block_height.map(|v| v as i64))
        .bind(&record.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_closure(&self, pipe_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let done = sqlx::query("DELETE FROM closures WHERE pipe_id = ?1")
            .bind(pipe_id)
            .execute(&mut *tx)
            .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get_closure(&self, pipe_id: &str) -> Result<Option<ClosureRecord>> {
        let row = sqlx::query_as::<_, ClosureRow>("SELECT * FROM closures WHERE pipe_id = ?1")
            .bind(pipe_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ClosureRow::into_record).transpose().map_err(Into::into)
    }

    pub async fn list_closures(&self) -> Result<Vec<ClosureRecord>> {
        let rows =
            sqlx::query_as::<_, ClosureRow>("SELECT * FROM closures ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|r| r.into_record().map_err(Into::into))
            .collect()
    }

    // ---- observed pipes ----

    pub async fn upsert_observed_pipe(&self, record: &ObservedPipeRecord) -> Result<()> {
        let pipe_key = serde_json::to_string(&record.pipe_key)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let pipe = serde_json::to_string(&record.pipe)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO observed_pipes (state_id, contract_id, pipe_id, pipe_key, pipe,
                   event_name, txid, block_height, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(state_id) DO UPDATE SET
                   pipe_key = excluded.pipe_key,
                   pipe = excluded.pipe,
                   event_name = excluded.event_name,
                   txid = excluded.txid,
                   block_height = excluded.block_height,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&record.state_id)
        .bind(&record.contract_id)
        .bind(&record.pipe_id)
        .bind(&pipe_key)
        .bind(&pipe)
        .bind(&record.event_name)
        .bind(&record.txid)
        .bind(record.block_height.map(|v| v as i64))
        .bind(&record.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_observed_pipe(&self, state_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let done = sqlx::query("DELETE FROM observed_pipes WHERE state_id = ?1")
            .bind(state_id)
            .execute(&mut *tx)
            .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get_observed_pipe(&self, state_id: &str) -> Result<Option<ObservedPipeRecord>> {
        let row = sqlx::query_as::<_, ObservedPipeRow>(
            "SELECT * FROM observed_pipes WHERE state_id = ?1",
        )
        .bind(state_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ObservedPipeRow::into_record)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn list_observed_pipes(&self) -> Result<Vec<ObservedPipeRecord>> {
        let rows = sqlx::query_as::<_, ObservedPipeRow>(
            "SELECT * FROM observed_pipes ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_record().map_err(Into::into))
            .collect()
    }

    // ---- signature states ----

    pub async fn upsert_signature_state(&self, record: &SignatureStateRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO signature_states (state_id, contract_id, pipe_id, for_principal,
                   with_principal, token, amount, my_balance, their_balance, my_signature,
                   their_signature, nonce, action, actor, secret, valid_after, beneficial_only,
                   updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                   ?17, ?18)
               ON CONFLICT(state_id) DO UPDATE SET
                   token = excluded.token,
                   amount = excluded.amount,
                   my_balance = excluded.my_balance,
                   their_balance = excluded.their_balance,
                   my_signature = excluded.my_signature,
                   their_signature = excluded.their_signature,
                   nonce = excluded.nonce,
                   action = excluded.action,
                   actor = excluded.actor,
                   secret = excluded.secret,
                   valid_after = excluded.valid_after,
                   beneficial_only = excluded.beneficial_only,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&record.state_id)
        .bind(&record.contract_id)
        .bind(&record.pipe_id)
        .bind(&record.for_principal)
        .bind(&record.with_principal)
        .bind(&record.token)
        .bind(&record.amount)
        .bind(&record.my_balance)
        .bind(&record.their_balance)
        .bind(&record.my_signature)
        .bind(&record.their_signature)
        .bind(&record.nonce)
        .bind(record.action as i64)
        .bind(&record.actor)
        .bind(&record.secret)
        .bind(&record.valid_after)
        .bind(record.beneficial_only)
        .bind(&record.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_signature_state(
        &self,
        state_id: &str,
    ) -> Result<Option<SignatureStateRecord>> {
        let row = sqlx::query_as::<_, SignatureStateRow>(
            "SELECT * FROM signature_states WHERE state_id = ?1",
        )
        .bind(state_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_signature_states(&self, limit: i64) -> Result<Vec<SignatureStateRecord>> {
        let rows = sqlx::query_as::<_, SignatureStateRow>(
            "SELECT * FROM signature_states ORDER BY updated_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn signature_states_for_pipe(
        &self,
        contract_id: &str,
        pipe_id: &str,
    ) -> Result<Vec<SignatureStateRecord>> {
        let rows = sqlx::query_as::<_, SignatureStateRow>(
            "SELECT * FROM signature_states WHERE contract_id = ?1 AND pipe_id = ?2",
        )
        .bind(contract_id)
        .bind(pipe_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ---- dispute attempts ----

    pub async fn insert_dispute_attempt(&self, record: &DisputeAttemptRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO dispute_attempts (attempt_id, contract_id, pipe_id, for_principal,
                   trigger_txid, success, dispute_txid, error, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(&record.attempt_id)
        .bind(&record.contract_id)
        .bind(&record.pipe_id)
        .bind(&record.for_principal)
        .bind(&record.trigger_txid)
        .bind(record.success)
        .bind(&record.dispute_txid)
        .bind(&record.error)
        .bind(&record.created_at)
        .execute(&mut *tx)
        .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_dispute_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<DisputeAttemptRecord>> {
        let row = sqlx::query_as::<_, DisputeAttemptRow>(
            "SELECT * FROM dispute_attempts WHERE attempt_id = ?1",
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_dispute_attempts(&self, limit: i64) -> Result<Vec<DisputeAttemptRecord>> {
        let rows = sqlx::query_as::<_, DisputeAttemptRow>(
            "SELECT * FROM dispute_attempts ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ---- recent events ring ----

    pub async fn record_event(&self, record: &RecordedEvent) -> Result<()> {
        let payload = serde_json::to_string(record)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO recent_events (contract_id, event_name, payload, observed_at, source)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(&record.event.contract_id)
        .bind(&record.event.event_name)
        .bind(&payload)
        .bind(&record.observed_at)
        .bind(&record.source)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"DELETE FROM recent_events WHERE id NOT IN
                   (SELECT id FROM recent_events ORDER BY id DESC LIMIT ?1)"#,
        )
        .bind(self.max_recent_events as i64)
        .execute(&mut *tx)
        .await?;
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_recent_events(&self, limit: i64) -> Result<Vec<RecordedEvent>> {
        let rows = sqlx::query_as::<_, RecentEventRow>(
            "SELECT payload FROM recent_events ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_record().map_err(Into::into))
            .collect()
    }

    // ---- aggregates ----

    pub async fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            closures: self.count("closures").await?,
            observed_pipes: self.count("observed_pipes").await?,
            signature_states: self.count("signature_states").await?,
            dispute_attempts: self.count("dispute_attempts").await?,
            recent_events: self.count("recent_events").await?,
        })
    }

    async fn count(&self, table: &str) -> Result<i64> {
        // Table names are fixed by the caller above, never user input.
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Consistent-enough view of all tables. Reads are not a single
    /// transaction: callers never cross-index between lists.
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(StoreSnapshot {
            closures: self.list_closures().await?,
            observed_pipes: self.list_observed_pipes().await?,
            signature_states: self.list_signature_states(i64::MAX).await?,
            dispute_attempts: self.list_dispute_attempts(i64::MAX).await?,
            recent_events: self.list_recent_events(i64::MAX).await?,
        })
    }

    /// All legacy rows land in one transaction: either the whole snapshot
    /// imports or none of it does.
    async fn import_legacy(&self, snapshot: LegacySnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let encode = |e: serde_json::Error| sqlx::Error::Encode(Box::new(e));

        for closure in snapshot.closures.values() {
            sqlx::query(
                r#"INSERT INTO closures (pipe_id, contract_id, pipe_key, closer, expires_at,
                       nonce, event_name, trigger_txid, block_height, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            )
            .bind(&closure.pipe_id)
            .bind(&closure.contract_id)
            .bind(serde_json::to_string(&closure.pipe_key).map_err(encode)?)
            .bind(&closure.closer)
            .bind(closure.expires_at.map(|v| v as i64))
            .bind(&closure.nonce)
            .bind(&closure.event_name)
            .bind(&closure.trigger_txid)
            .bind(closure.block_height.map(|v| v as i64))
            .bind(&closure.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        for pipe in snapshot.observed_pipes.values() {
            sqlx::query(
                r#"INSERT INTO observed_pipes (state_id, contract_id, pipe_id, pipe_key, pipe,
                       event_name, txid, block_height, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            )
            .bind(&pipe.state_id)
            .bind(&pipe.contract_id)
            .bind(&pipe.pipe_id)
            .bind(serde_json::to_string(&pipe.pipe_key).map_err(encode)?)
            .bind(serde_json::to_string(&pipe.pipe).map_err(encode)?)
            .bind(&pipe.event_name)
            .bind(&pipe.txid)
            .bind(pipe.block_height.map(|v| v as i64))
            .bind(&pipe.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        for state in snapshot.signature_states.values() {
            sqlx::query(
                r#"INSERT INTO signature_states (state_id, contract_id, pipe_id, for_principal,
                       with_principal, token, amount, my_balance, their_balance, my_signature,
                       their_signature, nonce, action, actor, secret, valid_after,
                       beneficial_only, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                       ?16, ?17, ?18)"#,
            )
            .bind(&state.state_id)
            .bind(&state.contract_id)
            .bind(&state.pipe_id)
            .bind(&state.for_principal)
            .bind(&state.with_principal)
            .bind(&state.token)
            .bind(&state.amount)
            .bind(&state.my_balance)
            .bind(&state.their_balance)
            .bind(&state.my_signature)
            .bind(&state.their_signature)
            .bind(&state.nonce)
            .bind(state.action as i64)
            .bind(&state.actor)
            .bind(&state.secret)
            .bind(&state.valid_after)
            .bind(state.beneficial_only)
            .bind(&state.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        for attempt in snapshot.dispute_attempts.values() {
            sqlx::query(
                r#"INSERT INTO dispute_attempts (attempt_id, contract_id, pipe_id,
                       for_principal, trigger_txid, success, dispute_txid, error, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            )
            .bind(&attempt.attempt_id)
            .bind(&attempt.contract_id)
            .bind(&attempt.pipe_id)
            .bind(&attempt.for_principal)
            .bind(&attempt.trigger_txid)
            .bind(attempt.success)
            .bind(&attempt.dispute_txid)
            .bind(&attempt.error)
            .bind(&attempt.created_at)
            .execute(&mut *tx)
            .await?;
        }
        for event in &snapshot.recent_events {
            sqlx::query(
                r#"INSERT INTO recent_events (contract_id, event_name, payload, observed_at,
                       source)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
            )
            .bind(&event.event.contract_id)
            .bind(&event.event.event_name)
            .bind(serde_json::to_string(event).map_err(encode)?)
            .bind(&event.observed_at)
            .bind(&event.source)
            .execute(&mut *tx)
            .await?;
        }
        Self::touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn read_legacy_snapshot(path: &Path) -> EyreResult<Option<LegacySnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path).wrap_err_with(|| format!("failed to read {path:?}"))?;
    let starts_with_brace = raw
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if !starts_with_brace {
        return Ok(None);
    }
    let snapshot: LegacySnapshot = serde_json::from_slice(&raw)
        .wrap_err_with(|| format!("{path:?} looks like a legacy JSON snapshot but failed to parse"))?;
    Ok(Some(snapshot))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".pre-sqlite.{}.json", chrono::Utc::now().timestamp()));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{c32check_encode, PrincipalId, C32_VERSION_TESTNET};
    use crate::types::{PipeEvent, PipeKey, PipeSnapshot};

    fn principal(seed: u8) -> PrincipalId {
        PrincipalId::parse(&c32check_encode(C32_VERSION_TESTNET, &[seed; 20])).unwrap()
    }

    fn pipe_key() -> PipeKey {
        PipeKey::canonical(principal(1), principal(2), None).unwrap()
    }

    fn snapshot(nonce: u128) -> PipeSnapshot {
        PipeSnapshot {
            balance_1: 500,
            balance_2: 500,
            pending_1: None,
            pending_2: None,
            expires_at: None,
            nonce,
            closer: None,
        }
    }

    fn closure_record(pipe_id: &str, expires_at: Option<u64>) -> ClosureRecord {
        ClosureRecord {
            pipe_id: pipe_id.to_string(),
            contract_id: "contract".into(),
            pipe_key: pipe_key(),
            closer: Some(principal(2).to_string()),
            expires_at,
            nonce: "3".into(),
            event_name: "force-cancel".into(),
            trigger_txid: Some("0xforce1".into()),
            block_height: Some(4100),
            updated_at: now_rfc3339(),
        }
    }

    fn recorded(name: &str) -> RecordedEvent {
        RecordedEvent {
            event: PipeEvent {
                contract_id: "contract".into(),
                topic: "print".into(),
                txid: Some("0x01".into()),
                block_height: Some(1),
                block_hash: None,
                event_index: Some(0),
                event_name: name.into(),
                sender: None,
                pipe_key: Some(pipe_key()),
                pipe: Some(snapshot(1)),
            },
            observed_at: now_rfc3339(),
            source: "test".into(),
        }
    }

    #[tokio::test]
    async fn closure_crud_round_trips() {
        let store = Store::open_in_memory(10).await.unwrap();
        let record = closure_record("pipe-a", Some(4200));

        store.upsert_closure(&record).await.unwrap();
        let loaded = store.get_closure("pipe-a").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        assert!(store.delete_closure("pipe-a").await.unwrap());
        assert!(!store.delete_closure("pipe-a").await.unwrap());
        assert!(store.get_closure("pipe-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closure_null_expiry_survives_round_trip() {
        let store = Store::open_in_memory(10).await.unwrap();
        let record = closure_record("pipe-b", None);
        store.upsert_closure(&record).await.unwrap();
        let loaded = store.get_closure("pipe-b").await.unwrap().unwrap();
        assert_eq!(loaded.expires_at, None);
    }

    #[tokio::test]
    async fn recent_events_ring_is_bounded() {
        let store = Store::open_in_memory(3).await.unwrap();
        for i in 0..5 {
            store.record_event(&recorded(&format!("e{i}"))).await.unwrap();
        }
        let events = store.list_recent_events(100).await.unwrap();
        assert_eq!(events.len(), 3);
        // Newest first, oldest two trimmed.
        let names: Vec<_> = events.iter().map(|e| e.event.event_name.clone()).collect();
        assert_eq!(names, vec!["e4", "e3", "e2"]);
    }

    #[tokio::test]
    async fn meta_updated_at_moves_on_writes() {
        let store = Store::open_in_memory(10).await.unwrap();
        store.upsert_closure(&closure_record("p", None)).await.unwrap();
        let row: (String,) =
            sqlx::query_as("SELECT value FROM meta WHERE key = 'updated_at'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&row.0).is_ok());
    }

    #[tokio::test]
    async fn counts_reflect_rows() {
        let store = Store::open_in_memory(10).await.unwrap();
        store.upsert_closure(&closure_record("p", None)).await.unwrap();
        store.record_event(&recorded("fund-pipe")).await.unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.closures, 1);
        assert_eq!(counts.recent_events, 1);
        assert_eq!(counts.signature_states, 0);
    }

    #[tokio::test]
    async fn snapshot_reflects_all_tables() {
        let store = Store::open_in_memory(10).await.unwrap();
        store.upsert_closure(&closure_record("p", None)).await.unwrap();
        store.record_event(&recorded("fund-pipe")).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.closures.len(), 1);
        assert_eq!(snapshot.recent_events.len(), 1);
        assert!(snapshot.observed_pipes.is_empty());
        assert!(snapshot.signature_states.is_empty());
        assert!(snapshot.dispute_attempts.is_empty());
    }

    #[tokio::test]
    async fn legacy_json_snapshot_is_imported_and_backed_up() {
        let dir = std::env::temp_dir().join(format!(
            "watchtower-legacy-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("state.db");
        let _ = std::fs::remove_file(&db_path);

        let legacy = serde_json::json!({
            "closures": {
                "pipe-a": closure_record("pipe-a", Some(4200)),
            },
            "recentEvents": [recorded("fund-pipe")],
        });
        std::fs::write(&db_path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let store = Store::open(&db_path, 10).await.unwrap();
        let closure = store.get_closure("pipe-a").await.unwrap();
        assert!(closure.is_some());
        assert_eq!(store.counts().await.unwrap().recent_events, 1);
        store.close().await;

        let backups: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("pre-sqlite"))
            .collect();
        assert_eq!(backups.len(), 1, "legacy file renamed to backup");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
