use std::collections::BTreeMap;

use kindling_domain::cancellation::CancellationChecker;
use kindling_domain::ports::BoxFuture;
use kindling_domain::ports::automation::{
    AutomationAction, AutomationError, AutomationOutput, EmulatorAutomation, LibraryEvent,
};
use tokio::sync::mpsc;
use tracing::warn;

/// Stand-in driver for hosts without an emulator attached. Every operation
/// reports [`AutomationError::Unavailable`], which the HTTP layer maps to 503.
#[derive(Clone, Debug, Default)]
pub struct UnattachedEmulator;

impl EmulatorAutomation for UnattachedEmulator {
    fn perform<'a>(
        &'a self,
        user: &'a str,
        action: AutomationAction,
        _params: &'a BTreeMap<String, String>,
        _checker: CancellationChecker,
    ) -> BoxFuture<'a, Result<AutomationOutput, AutomationError>> {
        Box::pin(async move {
            warn!(user = %user, path = action.path(), "no emulator attached");
            Err(AutomationError::Unavailable(format!(
                "no emulator attached for {user}"
            )))
        })
    }

    fn scan_library<'a>(
        &'a self,
        user: &'a str,
        _params: &'a BTreeMap<String, String>,
        _sink: mpsc::Sender<LibraryEvent>,
        _checker: CancellationChecker,
    ) -> BoxFuture<'a, Result<(), AutomationError>> {
        Box::pin(async move {
            warn!(user = %user, "no emulator attached for library scan");
            Err(AutomationError::Unavailable(format!(
                "no emulator attached for {user}"
            )))
        })
    }
}
