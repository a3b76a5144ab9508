use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::BoxFuture;
use crate::cancellation::CancellationChecker;

/// Emulator operations exposed over HTTP. Each maps to one endpoint path.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutomationAction {
    OpenBook,
    OpenRandomBook,
    CloseBook,
    Navigate,
    State,
    Books,
    Auth,
    Screenshot,
    Shutdown,
}

impl AutomationAction {
    pub fn path(&self) -> &'static str {
        match self {
            Self::OpenBook => "/open-book",
            Self::OpenRandomBook => "/open-random-book",
            Self::CloseBook => "/close-book",
            Self::Navigate => "/navigate",
            Self::State => "/state",
            Self::Books => "/books",
            Self::Auth => "/auth",
            Self::Screenshot => "/screenshot",
            Self::Shutdown => "/shutdown",
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::CloseBook | Self::Shutdown => "POST",
            _ => "GET",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutomationOutput {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl AutomationOutput {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }
}

/// One server-sent event of a library scan. Chunks are replayed verbatim to
/// clients that join a running scan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LibraryEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl LibraryEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("operation cancelled by a newer or higher priority request")]
    Cancelled,
    /// The driver session dropped; the caller may retry the same request.
    #[error("automation session lost: {0}")]
    Retryable(String),
    #[error("automation failed: {0}")]
    Failed(String),
    #[error("emulator unavailable: {0}")]
    Unavailable(String),
}

/// The emulator driver for one user. Long-running implementations are
/// expected to poll the supplied [`CancellationChecker`] and return
/// [`AutomationError::Cancelled`] when it fires.
pub trait EmulatorAutomation: Send + Sync {
    fn perform<'a>(
        &'a self,
        user: &'a str,
        action: AutomationAction,
        params: &'a BTreeMap<String, String>,
        checker: CancellationChecker,
    ) -> BoxFuture<'a, Result<AutomationOutput, AutomationError>>;

    /// Emits library scan events to `sink` as they are produced.
    fn scan_library<'a>(
        &'a self,
        user: &'a str,
        params: &'a BTreeMap<String, String>,
        sink: mpsc::Sender<LibraryEvent>,
        checker: CancellationChecker,
    ) -> BoxFuture<'a, Result<(), AutomationError>>;
}
