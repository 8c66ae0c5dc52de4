//! Built-in tasks.
//!
//! A BUILTIN task's script names a handler registered here. Handlers receive
//! the task token and the chain parameter values and report their output as
//! a string. The table is an extension point; [`BuiltinRegistry::register`]
//! adds new handlers.

use std::collections::HashMap;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("unknown built-in task: {0:?}")]
    Unknown(String),

    #[error("invalid built-in argument: {0}")]
    InvalidArgument(String),

    #[error("built-in task cancelled")]
    Cancelled,
}

pub type BuiltinHandler = Box<
    dyn for<'a> Fn(&'a CancellationToken, &'a [String]) -> BoxFuture<'a, Result<String, BuiltinError>>
        + Send
        + Sync,
>;

/// Named table of built-in task handlers.
pub struct BuiltinRegistry {
    handlers: HashMap<&'static str, BuiltinHandler>,
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register("NoOp", |_, _| Box::pin(async { Ok(String::new()) }));
        registry.register("Sleep", |token, params| Box::pin(sleep_task(token, params)));
        registry.register("Log", |_, params| Box::pin(log_task(params)));
        registry
    }
}

impl BuiltinRegistry {
    pub fn register(&mut self, name: &'static str, handler: BuiltinHandler) {
        self.handlers.insert(name, handler);
    }

    /// Dispatch a BUILTIN task by the name in its script.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        name: &str,
        param_values: &[String],
    ) -> Result<String, BuiltinError> {
        let handler = self
            .handlers
            .get(name.trim())
            .ok_or_else(|| BuiltinError::Unknown(name.trim().to_string()))?;
        handler(token, param_values).await
    }
}

/// Sleep for the number of seconds given as the first parameter value.
async fn sleep_task(
    token: &CancellationToken,
    param_values: &[String],
) -> Result<String, BuiltinError> {
    let raw = param_values
        .first()
        .map(String::as_str)
        .unwrap_or_default()
        .trim()
        .trim_matches('"')
        .to_string();
    let seconds: u64 = raw
        .parse()
        .map_err(|_| BuiltinError::InvalidArgument(format!("sleep duration: {raw:?}")))?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BuiltinError::Cancelled),
        _ = tokio::time::sleep(std::time::Duration::from_secs(seconds)) => {
            Ok(format!("slept for {seconds}s"))
        }
    }
}

/// Write the parameter values to the daemon log.
async fn log_task(param_values: &[String]) -> Result<String, BuiltinError> {
    let message = param_values.join(" ");
    info!(message = %message, "log task");
    Ok(message)
}
