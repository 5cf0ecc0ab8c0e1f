//! Step handler contract.
//!
//! A step is the unit of work a worker executes. Every step is registered
//! with both a forward body (`run`) and a compensating body (`undo`); the
//! claim's [`Direction`](crate::model::Direction) decides which one fires.
//! Bodies must be idempotent: a crashed worker's step will be observed
//! again after lease expiry, and manual RETRY re-executes from scratch.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::StepClaim;

/// The distinguished, operationally-expected step failure.
///
/// Step authors raise this for recoverable conditions (backend unreachable,
/// resource busy). The worker treats any other error or panic from a step
/// body identically, so this type is a courtesy for carrying structured
/// detail, not a gate.
#[derive(Debug, Clone, PartialEq)]
pub struct StepError {
    /// Human-readable message; persisted as the step's `last_error`.
    pub message: String,

    /// Additional detail for debugging.
    pub details: Option<serde_json::Value>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Process-lifetime capabilities handed to every step body.
///
/// Holds whatever application-level drivers the concrete steps need
/// (container runtime, network client, ...), keyed by type. Populated once
/// at start-up next to the registry; immutable afterwards.
#[derive(Default)]
pub struct StepContext {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a capability, replacing any previous value of the same type.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Look up a capability by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("values", &self.values.len())
            .finish()
    }
}

/// A `{run, undo}` handler pair for one step identifier.
///
/// # Example
///
/// ```ignore
/// struct StartContainer;
///
/// #[async_trait]
/// impl StepHandler for StartContainer {
///     async fn run(&self, ctx: &StepContext, claim: &StepClaim) -> Result<(), StepError> {
///         let docker = ctx.get::<DockerDriver>().ok_or_else(|| StepError::new("no driver"))?;
///         docker.start(&claim.run_id.to_string()).await?;
///         Ok(())
///     }
///
///     async fn undo(&self, ctx: &StepContext, claim: &StepClaim) -> Result<(), StepError> {
///         // stop + remove the container
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Forward (apply) body.
    async fn run(&self, ctx: &StepContext, claim: &StepClaim) -> Result<(), StepError>;

    /// Compensating (rollback) body.
    async fn undo(&self, ctx: &StepContext, claim: &StepClaim) -> Result<(), StepError>;
}
