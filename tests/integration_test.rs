//! Integration tests against a live PostgreSQL database.
//!
//! These tests verify the daemon's database-facing behavior:
//! 1. Chain execution commits or rolls back as one transaction
//! 2. Run-status bookkeeping (admission, closing rows, crash repair)
//! 3. The client-name advisory lock admits exactly one daemon
//! 4. Task outcomes always reach the execution log
//! 5. Cancellation rolls a running chain back
//!
//! Set `CHAINWHEEL_TEST_DATABASE_URL` to run them; without it every test
//! skips. The schema is bootstrapped on first use and test data is truncated
//! between tests.

use std::env;
use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

use chainwheel::{Chain, Config, Database, RunStatus, Scheduler, TaskKind, TokioCommander};

const SCRATCH_TABLE: &str = "public.chainwheel_scratch";

struct TaskSpec {
    name: &'static str,
    kind: TaskKind,
    script: String,
    ignore_error: bool,
}

fn sql_task(script: &str) -> TaskSpec {
    TaskSpec {
        name: "sql step",
        kind: TaskKind::Sql,
        script: script.to_string(),
        ignore_error: false,
    }
}

fn program_task(script: &str, ignore_error: bool) -> TaskSpec {
    TaskSpec {
        name: "program step",
        kind: TaskKind::Program,
        script: script.to_string(),
        ignore_error,
    }
}

fn builtin_task(script: &str) -> TaskSpec {
    TaskSpec {
        name: "builtin step",
        kind: TaskKind::Builtin,
        script: script.to_string(),
        ignore_error: false,
    }
}

fn test_config(database_url: &str, client_name: &str) -> Config {
    Config {
        database_url: database_url.to_string(),
        client_name: client_name.to_string(),
        cron_workers: 2,
        chain_timeout_ms: 0,
        task_timeout_ms: 0,
        no_program_tasks: false,
        lock_wait_time: Duration::from_millis(100),
        lock_max_wait_time: Duration::from_millis(400),
        refetch_timeout: 3,
        poll_interval: Duration::from_secs(60),
        http_port: 0,
        start_init: false,
        start_upgrade: false,
        max_pool_connections: 5,
    }
}

/// Connect, bootstrap the schema and wipe test data. Returns `None` (skip)
/// when no test database is configured.
async fn harness(client_name: &str) -> Result<Option<(Database, Scheduler<TokioCommander>)>> {
    let database_url = match env::var("CHAINWHEEL_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: CHAINWHEEL_TEST_DATABASE_URL not set");
            return Ok(None);
        }
    };
    let db = Database::connect(&database_url, client_name, 5).await?;
    db.init_schema().await?;
    sqlx::raw_sql(
        "TRUNCATE timetable.run_status, timetable.execution_log, \
         timetable.chain_execution_parameters, timetable.chain_execution_config, \
         timetable.task_chain, timetable.base_task, timetable.database_connection CASCADE",
    )
    .execute(db.pool())
    .await?;
    sqlx::raw_sql(&format!(
        "CREATE TABLE IF NOT EXISTS {SCRATCH_TABLE} (v integer); TRUNCATE {SCRATCH_TABLE}"
    ))
    .execute(db.pool())
    .await?;
    let scheduler = Scheduler::new(
        db.clone(),
        test_config(&database_url, client_name),
        TokioCommander,
    );
    Ok(Some((db, scheduler)))
}

/// Seed a linear chain and return its head row.
async fn seed_chain(db: &Database, name: &str, specs: &[TaskSpec]) -> Result<Chain> {
    seed_chain_with(db, name, specs, 1, false, None).await
}

async fn seed_chain_with(
    db: &Database,
    name: &str,
    specs: &[TaskSpec],
    max_instances: i32,
    self_destruct: bool,
    run_at: Option<&str>,
) -> Result<Chain> {
    let pool = db.pool();
    let mut parent: Option<i32> = None;
    let mut root: Option<i32> = None;
    for spec in specs {
        let task_id: i32 = sqlx::query_scalar(
            "INSERT INTO timetable.base_task (name, kind, script) \
             VALUES ($1, $2, $3) RETURNING task_id",
        )
        .bind(spec.name)
        .bind(spec.kind.as_str())
        .bind(&spec.script)
        .fetch_one(pool)
        .await?;
        let element_id: i32 = sqlx::query_scalar(
            "INSERT INTO timetable.task_chain (parent_id, task_id, ignore_error) \
             VALUES ($1, $2, $3) RETURNING chain_id",
        )
        .bind(parent)
        .bind(task_id)
        .bind(spec.ignore_error)
        .fetch_one(pool)
        .await?;
        root.get_or_insert(element_id);
        parent = Some(element_id);
    }
    let chain_id = root.expect("a chain needs at least one task");
    let config_id: i32 = sqlx::query_scalar(
        "INSERT INTO timetable.chain_execution_config \
         (chain_id, chain_name, run_at, max_instances, live, self_destruct) \
         VALUES ($1, $2, $3, $4, true, $5) RETURNING chain_execution_config",
    )
    .bind(chain_id)
    .bind(name)
    .bind(run_at)
    .bind(max_instances)
    .bind(self_destruct)
    .fetch_one(pool)
    .await?;
    Ok(Chain {
        chain_id,
        config_id,
        chain_name: name.to_string(),
        max_instances,
        timeout_ms: 0,
        exclusive_execution: false,
        self_destruct,
        reboot: run_at == Some("@reboot"),
    })
}

async fn add_param(db: &Database, chain: &Chain, order_id: i32, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO timetable.chain_execution_parameters \
         (chain_execution_config, chain_id, order_id, value) VALUES ($1, $2, $3, $4::jsonb)",
    )
    .bind(chain.config_id)
    .bind(chain.chain_id)
    .bind(order_id)
    .bind(value)
    .execute(db.pool())
    .await?;
    Ok(())
}

async fn run_states(db: &Database, config_id: i32) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar(
        "SELECT execution_status FROM timetable.run_status \
         WHERE chain_execution_config = $1 ORDER BY run_status",
    )
    .bind(config_id)
    .fetch_all(db.pool())
    .await?)
}

async fn scratch_values(db: &Database) -> Result<Vec<i32>> {
    Ok(
        sqlx::query_scalar(&format!("SELECT v FROM {SCRATCH_TABLE} ORDER BY v"))
            .fetch_all(db.pool())
            .await?,
    )
}

async fn logged_return_codes(db: &Database, config_id: i32) -> Result<Vec<i32>> {
    Ok(sqlx::query_scalar(
        "SELECT returned_value FROM timetable.execution_log \
         WHERE chain_execution_config = $1 ORDER BY last_run",
    )
    .bind(config_id)
    .fetch_all(db.pool())
    .await?)
}

/// Run one admitted chain to completion.
async fn run_chain_once(
    db: &Database,
    scheduler: &Scheduler<TokioCommander>,
    chain: &Chain,
) -> Result<()> {
    let token = CancellationToken::new();
    let run_id = db
        .insert_chain_run_status(&token, chain)
        .await?
        .expect("chain admitted");
    scheduler.execute_chain(&token, chain, run_id).await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn sql_chain_commits_and_closes_its_run_status() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(
        &db,
        "simple-sql",
        &[sql_task(&format!("INSERT INTO {SCRATCH_TABLE} VALUES (1)"))],
    )
    .await?;

    run_chain_once(&db, &scheduler, &chain).await?;

    assert_eq!(scratch_values(&db).await?, vec![1]);
    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_DONE"]);
    assert_eq!(logged_return_codes(&db, chain.config_id).await?, [0]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn failing_program_rolls_the_whole_chain_back() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(
        &db,
        "failing-program",
        &[
            program_task("/bin/false", false),
            sql_task(&format!("INSERT INTO {SCRATCH_TABLE} VALUES (2)")),
        ],
    )
    .await?;

    run_chain_once(&db, &scheduler, &chain).await?;

    // The second task never ran and nothing was committed.
    assert!(scratch_values(&db).await?.is_empty());
    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_FAILED"]);
    // The failed task was audited exactly once, with its real exit code.
    assert_eq!(logged_return_codes(&db, chain.config_id).await?, [1]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn ignored_failure_lets_the_chain_finish() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(
        &db,
        "ignored-failure",
        &[
            program_task("/bin/false", true),
            sql_task(&format!("INSERT INTO {SCRATCH_TABLE} VALUES (2)")),
        ],
    )
    .await?;

    run_chain_once(&db, &scheduler, &chain).await?;

    assert_eq!(scratch_values(&db).await?, vec![2]);
    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_DONE"]);
    assert_eq!(logged_return_codes(&db, chain.config_id).await?, [1, 0]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn parameter_arrays_bind_into_sql_tasks() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(
        &db,
        "parameterized-sql",
        &[sql_task(&format!(
            "INSERT INTO {SCRATCH_TABLE} VALUES ($1::int)"
        ))],
    )
    .await?;
    add_param(&db, &chain, 1, r#"["5"]"#).await?;
    add_param(&db, &chain, 2, r#"["7"]"#).await?;

    run_chain_once(&db, &scheduler, &chain).await?;

    assert_eq!(scratch_values(&db).await?, vec![5, 7]);
    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_DONE"]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn builtin_chain_runs_to_completion() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(&db, "builtin-noop", &[builtin_task("NoOp")]).await?;
    run_chain_once(&db, &scheduler, &chain).await?;

    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_DONE"]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn self_destructing_chain_deletes_its_configuration() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain_with(
        &db,
        "one-shot",
        &[sql_task(&format!("INSERT INTO {SCRATCH_TABLE} VALUES (9)"))],
        1,
        true,
        None,
    )
    .await?;

    run_chain_once(&db, &scheduler, &chain).await?;

    let remaining: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM timetable.chain_execution_config WHERE chain_execution_config = $1",
    )
    .bind(chain.config_id)
    .fetch_one(db.pool())
    .await?;
    assert_eq!(remaining, 0);
    assert_eq!(scratch_values(&db).await?, vec![9]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn admission_is_capped_at_max_instances() -> Result<()> {
    let Some((db, _scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(&db, "capped", &[sql_task("SELECT 1")]).await?;
    let token = CancellationToken::new();

    let first = db.insert_chain_run_status(&token, &chain).await?;
    assert!(first.is_some());

    // The first execution is still open, so a second admission is refused
    // and no second STARTED row appears.
    let second = db.insert_chain_run_status(&token, &chain).await?;
    assert!(second.is_none());
    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED"]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn crash_repair_closes_dangling_openers_exactly_once() -> Result<()> {
    let Some((db, _scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    // A STARTED row with no closing row is what a crashed instance leaves.
    sqlx::raw_sql(
        "INSERT INTO timetable.run_status \
         (run_status, chain_id, execution_status, start_status, chain_execution_config, client_name) \
         SELECT id, 1, 'STARTED', id, 1, 'wheel_test' \
         FROM nextval('timetable.run_status_seq') AS id",
    )
    .execute(db.pool())
    .await?;

    let repaired = db.fix_scheduler_crash().await?;
    assert_eq!(repaired, 1);

    let dead: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM timetable.run_status \
         WHERE execution_status = 'DEAD' AND client_name = 'wheel_test'",
    )
    .fetch_one(db.pool())
    .await?;
    assert_eq!(dead, 1);

    // Running the repair again adds nothing.
    let repaired_again = db.fix_scheduler_crash().await?;
    assert_eq!(repaired_again, 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn client_name_lock_admits_exactly_one_daemon() -> Result<()> {
    let Some((db, _scheduler)) = harness("wheel_lock").await? else {
        return Ok(());
    };
    let database_url = env::var("CHAINWHEEL_TEST_DATABASE_URL")?;

    let token = CancellationToken::new();
    db.try_lock_client_name(&token, Duration::from_millis(50), Duration::from_millis(200))
        .await?;

    // A second daemon under the same name backs off until cancelled.
    let rival = Database::connect(&database_url, "wheel_lock", 2).await?;
    let rival_token = CancellationToken::new();
    let cancel = rival_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });
    let refused = rival
        .try_lock_client_name(
            &rival_token,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
        .await;
    assert!(refused.is_err());

    // Releasing the lock lets the rival in.
    db.release_client_name_lock().await;
    let admitted_token = CancellationToken::new();
    rival
        .try_lock_client_name(
            &admitted_token,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
        .await?;
    rival.release_client_name_lock().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn cancellation_fails_the_chain_but_keeps_the_audit_row() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let chain = seed_chain(&db, "long-running", &[sql_task("SELECT pg_sleep(5)")]).await?;
    let token = CancellationToken::new();
    let run_id = db
        .insert_chain_run_status(&token, &chain)
        .await?
        .expect("chain admitted");

    let chain_token = token.child_token();
    let stop = chain_token.clone();
    let runner = {
        let scheduler = scheduler.clone();
        let chain = chain.clone();
        tokio::spawn(async move { scheduler.execute_chain(&chain_token, &chain, run_id).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    stop.cancel();
    tokio::time::timeout(Duration::from_secs(20), runner).await??;

    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_FAILED"]);
    assert_eq!(logged_return_codes(&db, chain.config_id).await?, [-1]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn cron_matching_selects_due_chains_only() -> Result<()> {
    let Some((db, _scheduler)) = harness("wheel_test").await? else {
        return Ok(());
    };

    let every_minute = seed_chain_with(
        &db,
        "every-minute",
        &[sql_task("SELECT 1")],
        1,
        false,
        Some("* * * * *"),
    )
    .await?;
    let reboot_only = seed_chain_with(
        &db,
        "reboot-only",
        &[sql_task("SELECT 1")],
        1,
        false,
        Some("@reboot"),
    )
    .await?;

    let token = CancellationToken::new();
    let due: Vec<i32> = db
        .select_chains(&token)
        .await?
        .iter()
        .map(|c| c.config_id)
        .collect();
    assert!(due.contains(&every_minute.config_id));
    assert!(!due.contains(&reboot_only.config_id));

    let reboot: Vec<i32> = db
        .select_reboot_chains(&token)
        .await?
        .iter()
        .map(|c| c.config_id)
        .collect();
    assert!(reboot.contains(&reboot_only.config_id));
    assert!(!reboot.contains(&every_minute.config_id));
    Ok(())
}

#[tokio::test]
#[serial]
async fn start_signal_executes_a_chain_end_to_end() -> Result<()> {
    let Some((db, scheduler)) = harness("wheel_e2e").await? else {
        return Ok(());
    };

    let chain = seed_chain(
        &db,
        "notified",
        &[sql_task(&format!("INSERT INTO {SCRATCH_TABLE} VALUES (42)"))],
    )
    .await?;

    let root = CancellationToken::new();
    let runner = {
        let scheduler = scheduler.clone();
        let root = root.clone();
        tokio::spawn(async move { scheduler.run(&root).await })
    };

    // Give the listener a moment to attach, then fire the START signal.
    tokio::time::sleep(Duration::from_millis(500)).await;
    sqlx::query("SELECT pg_notify('wheel_e2e', $1)")
        .bind(format!(
            r#"{{"command": "START", "configID": {}}}"#,
            chain.config_id
        ))
        .execute(db.pool())
        .await?;

    let mut executed = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if scratch_values(&db).await? == vec![42] {
            executed = true;
            break;
        }
    }
    assert!(executed, "START signal did not execute the chain");

    // A STOP for a chain that is no longer active is a no-op.
    sqlx::query("SELECT pg_notify('wheel_e2e', $1)")
        .bind(format!(
            r#"{{"command": "STOP", "configID": {}}}"#,
            chain.config_id
        ))
        .execute(db.pool())
        .await?;
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The registry is empty once nothing is in flight.
    assert!(scheduler.active_chains().is_empty());

    root.cancel();
    let status = tokio::time::timeout(Duration::from_secs(20), runner).await??;
    assert_eq!(status, RunStatus::Shutdown);
    assert_eq!(run_states(&db, chain.config_id).await?, ["STARTED", "CHAIN_DONE"]);
    Ok(())
}
