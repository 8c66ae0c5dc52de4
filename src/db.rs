//! PostgreSQL gateway.
//!
//! All reads and writes the daemon performs go through [`Database`]:
//!
//! - chain and task retrieval (head rows, recursive element walk, parameters)
//! - run-status bookkeeping used for admission control and crash recovery
//! - the chain-scoped transaction used by the chain executor
//! - the session advisory lock enforcing client-name uniqueness
//! - the LISTEN/NOTIFY stream carrying START/STOP signals
//!
//! Operations that take a [`CancellationToken`] race the query against it and
//! surface [`DbError::Cancelled`] when the token wins. Finalization paths
//! (audit rows, run-status closing, commit/rollback, self-destruct) take no
//! token on purpose: a shutdown must not lose outcome records.
//!
//! Errors are logged here, once, and returned as typed values; callers match
//! on them without re-logging.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First advisory lock key shared by every daemon attached to a timetable
/// schema. The second key is the Adler-32 hash of the client name.
pub const APP_ID: i32 = 0x204F04EE_u32 as i32;

/// Chain-scoped transaction handle.
pub type ChainTransaction = sqlx::Transaction<'static, Postgres>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type DbResult<T> = Result<T, DbError>;

/// A chain head row ready for execution. Immutable once fetched; consumed
/// exactly once by a worker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Chain {
    /// Root element of the task chain
    pub chain_id: i32,
    /// Primary key of the chain configuration row
    pub config_id: i32,
    pub chain_name: String,
    /// Maximum concurrent executions per configuration
    pub max_instances: i32,
    /// Chain timeout in milliseconds (0 = inherit the daemon default)
    pub timeout_ms: i32,
    /// Run alone, with no other chains in flight on this daemon
    pub exclusive_execution: bool,
    /// Delete the configuration row after a successful run
    pub self_destruct: bool,
    /// Scheduled once at daemon startup instead of by cron match
    pub reboot: bool,
}

/// Task kind stored in `base_task.kind`; decides execution dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Sql,
    Program,
    Builtin,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "SQL",
            Self::Program => "PROGRAM",
            Self::Builtin => "BUILTIN",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SQL" => Ok(Self::Sql),
            "PROGRAM" => Ok(Self::Program),
            "BUILTIN" => Ok(Self::Builtin),
            other => Err(format!("unknown task kind: {other:?}")),
        }
    }
}

impl sqlx::Type<Postgres> for TaskKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for TaskKind {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

/// One executable element of a chain, joined with its base-task metadata.
///
/// The `config_id` and `txid` fields are stamped by the chain executor before
/// dispatch; `started_at` and `duration_us` by the task executor.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainTask {
    pub chain_id: i32,
    pub task_id: i32,
    pub task_name: String,
    pub script: String,
    pub kind: TaskKind,
    pub run_uid: Option<String>,
    pub ignore_error: bool,
    /// Per-task timeout in milliseconds (0 = inherit the daemon default)
    pub timeout_ms: i32,
    pub database_connection: Option<i32>,
    /// Resolved connect string of the per-task database override, if any
    pub connect_string: Option<String>,
    #[sqlx(default)]
    pub config_id: i32,
    #[sqlx(default)]
    pub txid: i64,
    #[sqlx(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub duration_us: i64,
}

/// Lifecycle states recorded in `timetable.run_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Started,
    ChainFailed,
    ChainDone,
    Dead,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::ChainFailed => "CHAIN_FAILED",
            Self::ChainDone => "CHAIN_DONE",
            Self::Dead => "DEAD",
        }
    }
}

/// Command carried by a chain signal notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCommand {
    Start,
    Stop,
}

/// A START/STOP notification received from the server. A `config_id` of zero
/// means the notification stream terminated and intake must unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSignal {
    pub command: SignalCommand,
    pub config_id: i32,
}

impl ChainSignal {
    /// Stream-terminated sentinel.
    pub fn closed() -> Self {
        Self {
            command: SignalCommand::Stop,
            config_id: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.config_id == 0
    }
}

#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(default)]
    command: String,
    #[serde(rename = "configID", default)]
    config_id: i32,
}

/// Parse a notification payload. `None` for unknown commands, which are
/// ignored by the intake loop.
pub(crate) fn parse_chain_signal(payload: &str) -> DbResult<Option<ChainSignal>> {
    let raw: RawSignal = serde_json::from_str(payload)?;
    let command = match raw.command.as_str() {
        "START" => SignalCommand::Start,
        "STOP" => SignalCommand::Stop,
        _ => return Ok(None),
    };
    Ok(Some(ChainSignal {
        command,
        config_id: raw.config_id,
    }))
}

/// Main database handle.
///
/// Cloning is cheap; all clones share the pool and the dedicated
/// advisory-lock connection.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    url: Arc<String>,
    client_name: Arc<String>,
    /// The advisory lock is session-scoped, so it lives on its own
    /// connection rather than a pooled one.
    lock_conn: Arc<tokio::sync::Mutex<Option<PgConnection>>>,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(
        database_url: &str,
        client_name: &str,
        max_connections: u32,
    ) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            url: Arc::new(database_url.to_string()),
            client_name: Arc::new(client_name.to_string()),
            lock_conn: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Race a database future against the cancellation token.
    async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> DbResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DbError::Cancelled),
            res = fut => res.map_err(DbError::from),
        }
    }

    // ------------------------------------------------------------------
    // Instance lock
    // ------------------------------------------------------------------

    /// Obtain the session advisory lock preventing another daemon with the
    /// same client name. Retries with exponential backoff until acquired or
    /// the token fires; the only non-retryable outcome is cancellation.
    pub async fn try_lock_client_name(
        &self,
        token: &CancellationToken,
        wait_time: std::time::Duration,
        max_wait_time: std::time::Duration,
    ) -> DbResult<()> {
        let key = adler::adler32_slice(self.client_name.as_bytes()) as i32;
        let mut wait = wait_time;
        loop {
            debug!(
                client = %self.client_name,
                key = %format_args!("{key:#x}"),
                "trying to obtain the client name advisory lock"
            );
            match self.acquire_advisory_lock(token, key).await {
                Ok(true) => {
                    info!(client = %self.client_name, "client name advisory lock obtained");
                    return Ok(());
                }
                Ok(false) => {
                    error!(
                        client = %self.client_name,
                        "another daemon is already connected with this client name"
                    );
                }
                Err(DbError::Cancelled) => return Err(DbError::Cancelled),
                Err(err) => {
                    error!(error = %err, "client name locking failed");
                }
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DbError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            if wait < max_wait_time {
                wait = (wait * 2).min(max_wait_time);
            }
        }
    }

    async fn acquire_advisory_lock(
        &self,
        token: &CancellationToken,
        key: i32,
    ) -> DbResult<bool> {
        let mut slot = self.lock_conn.lock().await;
        if slot.is_none() {
            let conn = Self::cancellable(token, PgConnection::connect(&self.url)).await?;
            *slot = Some(conn);
        }
        let conn = slot.as_mut().expect("lock connection just installed");
        let locked = Self::cancellable(
            token,
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1, $2)")
                .bind(APP_ID)
                .bind(key)
                .fetch_one(conn),
        )
        .await;
        match locked {
            Ok(v) => Ok(v),
            Err(err) => {
                // The dedicated session is in an unknown state; rebuild it on
                // the next attempt.
                *slot = None;
                Err(err)
            }
        }
    }

    /// Release the advisory lock by closing its session.
    pub async fn release_client_name_lock(&self) {
        let mut slot = self.lock_conn.lock().await;
        if let Some(conn) = slot.take() {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "closing the advisory lock session failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Crash recovery
    // ------------------------------------------------------------------

    /// Close chains left open by a crashed instance of this client: every
    /// (client, start_status) group with fewer than two rows gets one
    /// synthetic DEAD row. Idempotent; runs at startup and after reconnect.
    pub async fn fix_scheduler_crash(&self) -> DbResult<u64> {
        let res = sqlx::query(
            r#"
            INSERT INTO timetable.run_status
                   (execution_status, started, last_status_update, start_status,
                    chain_execution_config, client_name)
            SELECT 'DEAD', now(), now(), start_status, 0, $1 FROM (
                SELECT start_status
                FROM timetable.run_status
                WHERE execution_status IN ('STARTED', 'CHAIN_FAILED', 'CHAIN_DONE', 'DEAD')
                  AND client_name = $1
                GROUP BY 1
                HAVING count(*) < 2) AS open_chains
            "#,
        )
        .bind(self.client_name.as_str())
        .execute(&self.pool)
        .await;
        match res {
            Ok(done) => {
                if done.rows_affected() > 0 {
                    info!(
                        closed = done.rows_affected(),
                        "closed run-status records left over from a crash"
                    );
                }
                Ok(done.rows_affected())
            }
            Err(err) => {
                error!(error = %err, "crash recovery of run-status records failed");
                Err(err.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Chain retrieval
    // ------------------------------------------------------------------

    const SELECT_CHAIN_COLUMNS: &'static str = r#"
        SELECT cc.chain_id,
               cc.chain_execution_config AS config_id,
               cc.chain_name,
               cc.max_instances,
               cc.timeout AS timeout_ms,
               cc.exclusive_execution,
               cc.self_destruct,
               coalesce(cc.run_at = '@reboot', false) AS reboot
        FROM timetable.chain_execution_config cc
        WHERE cc.live
          AND cc.chain_id IS NOT NULL
          AND (cc.client_name IS NULL OR cc.client_name = $1)
    "#;

    /// Head rows of every chain currently due by its cron schedule.
    pub async fn select_chains(&self, token: &CancellationToken) -> DbResult<Vec<Chain>> {
        let sql = format!(
            "{} AND timetable.is_cron_matched(cc.run_at, now())",
            Self::SELECT_CHAIN_COLUMNS
        );
        let res = Self::cancellable(
            token,
            sqlx::query_as::<_, Chain>(&sql)
                .bind(self.client_name.as_str())
                .fetch_all(&self.pool),
        )
        .await;
        if let Err(err) = &res {
            error!(error = %err, "querying scheduled chains failed");
        }
        res
    }

    /// Head rows of chains flagged to run once at daemon startup.
    pub async fn select_reboot_chains(&self, token: &CancellationToken) -> DbResult<Vec<Chain>> {
        let sql = format!("{} AND cc.run_at = '@reboot'", Self::SELECT_CHAIN_COLUMNS);
        let res = Self::cancellable(
            token,
            sqlx::query_as::<_, Chain>(&sql)
                .bind(self.client_name.as_str())
                .fetch_all(&self.pool),
        )
        .await;
        if let Err(err) = &res {
            error!(error = %err, "querying reboot chains failed");
        }
        res
    }

    /// One specific chain head, requested by an asynchronous START signal.
    pub async fn select_chain(
        &self,
        token: &CancellationToken,
        config_id: i32,
    ) -> DbResult<Option<Chain>> {
        let sql = format!(
            "{} AND cc.chain_execution_config = $2",
            Self::SELECT_CHAIN_COLUMNS
        );
        let res = Self::cancellable(
            token,
            sqlx::query_as::<_, Chain>(&sql)
                .bind(self.client_name.as_str())
                .bind(config_id)
                .fetch_optional(&self.pool),
        )
        .await;
        if let Err(err) = &res {
            error!(config = config_id, error = %err, "querying chain head failed");
        }
        res
    }

    /// Walk the task chain from its root element to the leaves, preserving
    /// declared order, joined with base-task metadata and the resolved
    /// connect string of any per-task database override.
    pub async fn get_chain_elements(
        &self,
        token: &CancellationToken,
        tx: &mut ChainTransaction,
        chain_id: i32,
    ) -> DbResult<Vec<ChainTask>> {
        const SQL: &str = r#"
            WITH RECURSIVE chain_tasks
                (chain_id, task_id, task_name, script, kind, run_uid, ignore_error,
                 timeout_ms, database_connection) AS (
                SELECT tc.chain_id, tc.task_id, bt.name, bt.script, bt.kind,
                       tc.run_uid, tc.ignore_error, tc.timeout, tc.database_connection
                FROM timetable.task_chain tc
                JOIN timetable.base_task bt USING (task_id)
                WHERE tc.parent_id IS NULL AND tc.chain_id = $1
                UNION ALL
                SELECT tc.chain_id, tc.task_id, bt.name, bt.script, bt.kind,
                       tc.run_uid, tc.ignore_error, tc.timeout, tc.database_connection
                FROM timetable.task_chain tc
                JOIN timetable.base_task bt USING (task_id)
                JOIN chain_tasks ct ON ct.chain_id = tc.parent_id
            )
            SELECT ct.*,
                   (SELECT connect_string
                    FROM timetable.database_connection dc
                    WHERE dc.database_connection = ct.database_connection) AS connect_string
            FROM chain_tasks ct
        "#;
        let res = Self::cancellable(
            token,
            sqlx::query_as::<_, ChainTask>(SQL)
                .bind(chain_id)
                .fetch_all(&mut **tx),
        )
        .await;
        if let Err(err) = &res {
            error!(chain = chain_id, error = %err, "recursive task chain query failed");
        }
        res
    }

    /// Ordered parameter values for a (configuration, chain) pair. Each entry
    /// is a JSON-encoded argument array; an empty string stands for a NULL
    /// value and produces an argument-less invocation.
    pub async fn get_chain_param_values(
        &self,
        token: &CancellationToken,
        tx: &mut ChainTransaction,
        task: &ChainTask,
    ) -> DbResult<Vec<String>> {
        const SQL: &str = r#"
            SELECT value::text
            FROM timetable.chain_execution_parameters
            WHERE chain_execution_config = $1
              AND chain_id = $2
            ORDER BY order_id ASC
        "#;
        let res = Self::cancellable(
            token,
            sqlx::query_scalar::<_, Option<String>>(SQL)
                .bind(task.config_id)
                .bind(task.chain_id)
                .fetch_all(&mut **tx),
        )
        .await;
        match res {
            Ok(values) => Ok(values.into_iter().map(Option::unwrap_or_default).collect()),
            Err(err) => {
                error!(task = task.task_id, error = %err, "fetching chain parameters failed");
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Run status
    // ------------------------------------------------------------------

    /// Combined admission check and opener: inserts a STARTED row only while
    /// fewer than `max_instances` executions of the configuration are open
    /// across all daemons, and returns the new run-status id. `None` means
    /// admission was refused.
    pub async fn insert_chain_run_status(
        &self,
        token: &CancellationToken,
        chain: &Chain,
    ) -> DbResult<Option<i64>> {
        const SQL: &str = r#"
            WITH opener AS (
                SELECT nextval('timetable.run_status_seq') AS id
                WHERE (SELECT count(*) FROM timetable.get_running_jobs($2)) < $3
            )
            INSERT INTO timetable.run_status
                   (run_status, chain_id, execution_status, started, last_status_update,
                    start_status, chain_execution_config, client_name)
            SELECT id, $1, 'STARTED', now(), now(), id, $2, $4 FROM opener
            RETURNING run_status
        "#;
        let res = Self::cancellable(
            token,
            sqlx::query_scalar::<_, i64>(SQL)
                .bind(chain.chain_id)
                .bind(chain.config_id)
                .bind(chain.max_instances)
                .bind(self.client_name.as_str())
                .fetch_optional(&self.pool),
        )
        .await;
        if let Err(err) = &res {
            error!(chain = chain.config_id, error = %err, "recording the chain run status failed");
        }
        res
    }

    /// Close the run-status record opened by [`insert_chain_run_status`].
    /// Deliberately not cancellable: the outcome row must survive shutdown.
    pub async fn close_chain_run_status(&self, chain: &Chain, run_id: i64, state: RunState) {
        const SQL: &str = r#"
            INSERT INTO timetable.run_status
                   (chain_id, execution_status, started, last_status_update,
                    start_status, chain_execution_config, client_name)
            VALUES ($1, $2, now(), now(), $3, $4, $5)
        "#;
        if let Err(err) = sqlx::query(SQL)
            .bind(chain.chain_id)
            .bind(state.as_str())
            .bind(run_id)
            .bind(chain.config_id)
            .bind(self.client_name.as_str())
            .execute(&self.pool)
            .await
        {
            error!(chain = chain.config_id, error = %err, "closing the chain run status failed");
        }
    }

    /// Append the per-task outcome to the execution log. Runs outside the
    /// chain transaction and without a token so the audit row persists even
    /// when the chain rolls back or the daemon shuts down.
    pub async fn log_chain_element_execution(&self, task: &ChainTask, ret_code: i32, output: &str) {
        const SQL: &str = r#"
            INSERT INTO timetable.execution_log
                   (chain_execution_config, chain_id, task_id, transaction_id, name,
                    script, kind, last_run, finished, returned_value, duration_us,
                    output, client_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, clock_timestamp(), $9, $10,
                    nullif($11, ''), $12)
        "#;
        if let Err(err) = sqlx::query(SQL)
            .bind(task.config_id)
            .bind(task.chain_id)
            .bind(task.task_id)
            .bind(task.txid)
            .bind(&task.task_name)
            .bind(&task.script)
            .bind(task.kind.as_str())
            .bind(task.started_at)
            .bind(ret_code)
            .bind(task.duration_us)
            .bind(output)
            .bind(self.client_name.as_str())
            .execute(&self.pool)
            .await
        {
            error!(task = task.task_id, error = %err, "recording the task execution failed");
        }
    }

    /// Remove a self-destructing chain configuration after a successful run.
    pub async fn delete_chain_config(&self, config_id: i32) -> bool {
        info!(config = config_id, "deleting self-destructing chain configuration");
        match sqlx::query(
            "DELETE FROM timetable.chain_execution_config WHERE chain_execution_config = $1",
        )
        .bind(config_id)
        .execute(&self.pool)
        .await
        {
            Ok(res) => res.rows_affected() == 1,
            Err(err) => {
                error!(config = config_id, error = %err, "deleting the chain configuration failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Chain transaction
    // ------------------------------------------------------------------

    /// Open the chain-scoped transaction and report the server-assigned
    /// transaction id used in logging.
    pub async fn start_transaction(
        &self,
        token: &CancellationToken,
        chain_id: i32,
    ) -> DbResult<(ChainTransaction, i64)> {
        let mut tx = Self::cancellable(token, self.pool.begin()).await?;
        let txid = Self::cancellable(
            token,
            sqlx::query_scalar::<_, i64>("SELECT txid_current()").fetch_one(&mut *tx),
        )
        .await?;
        debug!(chain = chain_id, txid, "chain transaction started");
        Ok((tx, txid))
    }

    /// Commit the chain transaction. Not cancellable.
    pub async fn commit_transaction(&self, tx: ChainTransaction) {
        if let Err(err) = tx.commit().await {
            error!(error = %err, "committing the chain transaction failed");
        }
    }

    /// Roll the chain transaction back. Not cancellable.
    pub async fn rollback_transaction(&self, tx: ChainTransaction) {
        if let Err(err) = tx.rollback().await {
            error!(error = %err, "rolling back the chain transaction failed");
        }
    }

    // ------------------------------------------------------------------
    // SQL task execution
    // ------------------------------------------------------------------

    /// Execute an SQL task script. Each parameter entry is decoded into an
    /// argument array and bound positionally; without parameters the script
    /// runs once as-is. A per-task connection override runs the script on a
    /// one-shot autocommit connection instead of the chain transaction.
    pub async fn execute_sql_task(
        &self,
        token: &CancellationToken,
        tx: &mut ChainTransaction,
        task: &ChainTask,
        param_values: &[String],
    ) -> DbResult<String> {
        let mut affected = 0u64;
        let entries: Vec<&str> = if param_values.is_empty() {
            vec![""]
        } else {
            param_values.iter().map(String::as_str).collect()
        };

        if let Some(connect_string) = task.connect_string.as_deref() {
            let mut conn = Self::cancellable(token, PgConnection::connect(connect_string)).await?;
            for entry in &entries {
                affected += Self::run_script(token, &mut conn, &task.script, entry).await?;
            }
            let _ = conn.close().await;
        } else {
            for entry in &entries {
                affected += Self::run_script(token, &mut **tx, &task.script, entry).await?;
            }
        }
        Ok(format!("{affected} rows affected"))
    }

    async fn run_script<'c, E>(
        token: &CancellationToken,
        executor: E,
        script: &'c str,
        entry: &str,
    ) -> DbResult<u64>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        if entry.trim().is_empty() {
            let res = Self::cancellable(token, sqlx::raw_sql(script).execute(executor)).await?;
            return Ok(res.rows_affected());
        }
        let args: Vec<serde_json::Value> = serde_json::from_str(entry)?;
        let mut query = sqlx::query(script);
        for arg in &args {
            query = match arg {
                serde_json::Value::Null => query.bind(None::<String>),
                serde_json::Value::String(s) => query.bind(Some(s.clone())),
                other => query.bind(Some(other.to_string())),
            };
        }
        let res = Self::cancellable(token, query.execute(executor)).await?;
        Ok(res.rows_affected())
    }

    // ------------------------------------------------------------------
    // Signal stream
    // ------------------------------------------------------------------

    /// Start LISTENing for chain signals on this client's channel.
    pub async fn signal_listener(&self) -> DbResult<SignalListener> {
        let mut listener = PgListener::connect(&self.url).await?;
        listener.listen(&self.client_name).await?;
        info!(channel = %self.client_name, "listening for chain signals");
        Ok(SignalListener { listener })
    }

    // ------------------------------------------------------------------
    // Schema bootstrap
    // ------------------------------------------------------------------

    /// Create the timetable schema objects the daemon works against.
    /// Idempotent; used by `--init`/`--upgrade` startup and by tests.
    pub async fn init_schema(&self) -> DbResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("timetable schema objects are in place");
        Ok(())
    }
}

/// Blocking reader over the chain signal stream.
pub struct SignalListener {
    listener: PgListener,
}

impl SignalListener {
    /// Wait for the next well-formed chain signal. Returns the
    /// stream-terminated sentinel when the connection drops or the token
    /// fires; unknown commands and malformed payloads are skipped.
    pub async fn wait(&mut self, token: &CancellationToken) -> ChainSignal {
        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => return ChainSignal::closed(),
                res = self.listener.try_recv() => res,
            };
            match received {
                Ok(Some(notification)) => match parse_chain_signal(notification.payload()) {
                    Ok(Some(signal)) => {
                        debug!(?signal, "chain signal received");
                        return signal;
                    }
                    Ok(None) => {
                        warn!(payload = notification.payload(), "ignoring unknown chain signal");
                    }
                    Err(err) => {
                        warn!(
                            payload = notification.payload(),
                            error = %err,
                            "ignoring malformed chain signal"
                        );
                    }
                },
                Ok(None) => {
                    warn!("chain signal stream lost its connection");
                    return ChainSignal::closed();
                }
                Err(err) => {
                    error!(error = %err, "chain signal stream failed");
                    return ChainSignal::closed();
                }
            }
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS timetable;

CREATE TABLE IF NOT EXISTS timetable.database_connection (
    database_connection SERIAL PRIMARY KEY,
    connect_string      TEXT NOT NULL,
    comment             TEXT
);

CREATE TABLE IF NOT EXISTS timetable.base_task (
    task_id SERIAL PRIMARY KEY,
    name    TEXT NOT NULL,
    kind    TEXT NOT NULL DEFAULT 'SQL' CHECK (kind IN ('SQL', 'PROGRAM', 'BUILTIN')),
    script  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timetable.task_chain (
    chain_id            SERIAL PRIMARY KEY,
    parent_id           INTEGER UNIQUE REFERENCES timetable.task_chain (chain_id)
                        ON DELETE CASCADE,
    task_id             INTEGER NOT NULL REFERENCES timetable.base_task (task_id),
    run_uid             TEXT,
    database_connection INTEGER REFERENCES timetable.database_connection (database_connection),
    ignore_error        BOOLEAN NOT NULL DEFAULT false,
    timeout             INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS timetable.chain_execution_config (
    chain_execution_config SERIAL PRIMARY KEY,
    chain_id               INTEGER REFERENCES timetable.task_chain (chain_id),
    chain_name             TEXT NOT NULL UNIQUE,
    run_at                 TEXT,
    max_instances          INTEGER NOT NULL DEFAULT 1,
    timeout                INTEGER NOT NULL DEFAULT 0,
    live                   BOOLEAN NOT NULL DEFAULT false,
    self_destruct          BOOLEAN NOT NULL DEFAULT false,
    exclusive_execution    BOOLEAN NOT NULL DEFAULT false,
    client_name            TEXT
);

CREATE TABLE IF NOT EXISTS timetable.chain_execution_parameters (
    chain_execution_config INTEGER NOT NULL,
    chain_id               INTEGER NOT NULL,
    order_id               INTEGER NOT NULL CHECK (order_id > 0),
    value                  JSONB,
    PRIMARY KEY (chain_execution_config, chain_id, order_id)
);

CREATE SEQUENCE IF NOT EXISTS timetable.run_status_seq;

CREATE TABLE IF NOT EXISTS timetable.run_status (
    run_status             BIGINT PRIMARY KEY DEFAULT nextval('timetable.run_status_seq'),
    chain_id               INTEGER,
    execution_status       TEXT NOT NULL
                           CHECK (execution_status IN
                                  ('STARTED', 'CHAIN_FAILED', 'CHAIN_DONE', 'DEAD')),
    started                TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_status_update     TIMESTAMPTZ NOT NULL DEFAULT now(),
    start_status           BIGINT,
    chain_execution_config INTEGER NOT NULL,
    client_name            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timetable.execution_log (
    chain_execution_config INTEGER,
    chain_id               INTEGER,
    task_id                INTEGER,
    transaction_id         BIGINT,
    name                   TEXT,
    script                 TEXT,
    kind                   TEXT,
    last_run               TIMESTAMPTZ DEFAULT now(),
    finished               TIMESTAMPTZ,
    returned_value         INTEGER,
    duration_us            BIGINT,
    output                 TEXT,
    client_name            TEXT NOT NULL
);

CREATE OR REPLACE FUNCTION timetable.get_running_jobs(config_id integer)
RETURNS TABLE (id integer, status bigint) AS $$
    SELECT chain_execution_config, start_status
    FROM timetable.run_status
    WHERE start_status IN (
            SELECT start_status
            FROM timetable.run_status
            WHERE execution_status IN ('STARTED', 'CHAIN_FAILED', 'CHAIN_DONE', 'DEAD')
            GROUP BY 1
            HAVING count(*) < 2)
      AND chain_execution_config = $1
    GROUP BY 1, 2
    ORDER BY 1
$$ LANGUAGE sql STRICT;

CREATE OR REPLACE FUNCTION timetable.cron_part_matches(part text, val integer)
RETURNS boolean AS $$
DECLARE
    item   text;
    bounds text[];
BEGIN
    IF part = '*' THEN
        RETURN true;
    END IF;
    FOREACH item IN ARRAY string_to_array(part, ',') LOOP
        IF item = '*' THEN
            RETURN true;
        ELSIF item LIKE '*/%' AND substr(item, 3) ~ '^\d+$' THEN
            IF substr(item, 3)::integer > 0 AND val % substr(item, 3)::integer = 0 THEN
                RETURN true;
            END IF;
        ELSIF item LIKE '%-%' THEN
            bounds := string_to_array(item, '-');
            IF array_length(bounds, 1) = 2
               AND bounds[1] ~ '^\d+$' AND bounds[2] ~ '^\d+$'
               AND val BETWEEN bounds[1]::integer AND bounds[2]::integer THEN
                RETURN true;
            END IF;
        ELSIF item ~ '^\d+$' AND item::integer = val THEN
            RETURN true;
        END IF;
    END LOOP;
    RETURN false;
END;
$$ LANGUAGE plpgsql IMMUTABLE;

CREATE OR REPLACE FUNCTION timetable.is_cron_matched(run_at text, ts timestamptz)
RETURNS boolean AS $$
DECLARE
    parts text[];
BEGIN
    IF run_at IS NULL OR run_at = '@reboot' THEN
        RETURN false;
    END IF;
    parts := regexp_split_to_array(trim(run_at), '\s+');
    IF array_length(parts, 1) <> 5 THEN
        RETURN false;
    END IF;
    RETURN timetable.cron_part_matches(parts[1], date_part('minute', ts)::integer)
       AND timetable.cron_part_matches(parts[2], date_part('hour', ts)::integer)
       AND timetable.cron_part_matches(parts[3], date_part('day', ts)::integer)
       AND timetable.cron_part_matches(parts[4], date_part('month', ts)::integer)
       AND timetable.cron_part_matches(parts[5], date_part('dow', ts)::integer);
END;
$$ LANGUAGE plpgsql IMMUTABLE;
"#;
