//! Chainwheel - a PostgreSQL-backed chain scheduling daemon.
//!
//! PostgreSQL has no native time triggers, so an external worker has to poll
//! and listen for due task chains, execute their steps, and record outcomes
//! back into the same database. This crate is that worker. The key
//! components are:
//!
//! ## Execution
//!
//! - [`Scheduler`]: the runtime owning intake loops, the worker pool and
//!   all coordination state
//! - [`Commander`]: external program execution, injectable for tests
//! - [`BuiltinRegistry`]: named built-in task handlers
//!
//! ## Database
//!
//! - [`Database`]: typed gateway for chains, tasks, parameters, run-status
//!   bookkeeping, advisory locks and the START/STOP notification stream
//!
//! ## Coordination
//!
//! - [`ActiveChains`]: registry of in-flight executions used by STOP
//!   signals and graceful shutdown
//! - a client-name advisory lock keeping one daemon per name per database

pub mod builtins;
pub mod command;
pub mod config;
pub mod db;
mod executor;
mod intake;
pub mod status;
pub mod supervisor;
pub mod worker;

// Configuration
pub use config::Config;

// Database
pub use db::{
    Chain, ChainSignal, ChainTask, ChainTransaction, Database, DbError, DbResult, RunState,
    SignalCommand, SignalListener, TaskKind, APP_ID,
};

// Execution
pub use builtins::{BuiltinError, BuiltinRegistry};
pub use command::{Commander, ProgramOutcome, TokioCommander};
pub use supervisor::{RunStatus, Scheduler};
pub use worker::ActiveChains;
