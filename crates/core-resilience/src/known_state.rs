//! Wait for a set of nodes to reach the install backend's ready status
//!
//! The backend reports a free-form status string per node. Two literals are
//! meaningful here: [`READY_STATUS`] ends the wait once every node reports it,
//! and [`ERROR_STATUS`] from any node aborts the wait immediately.

use super::error::{KnownStateError, PollError};
use super::poll::{Poll, PollConfig, PollLoop};
use std::collections::BTreeMap;
use tracing::info;

/// Terminal success status reported by the backend
pub const READY_STATUS: &str = "known";

/// Status that aborts the whole wait
pub const ERROR_STATUS: &str = "error";

/// Status per node name; `None` when the backend does not know the node yet
pub type StatusSnapshot = BTreeMap<String, Option<String>>;

/// Poll `lookup` for every name until all report [`READY_STATUS`]
///
/// The aggregate snapshot is logged only when it changes. `tick` runs once per
/// poll after the error check and may abort the wait (the orchestrator uses it
/// to surface failed boot commands early).
pub fn wait_known_state<E, L, T>(
    names: &[String],
    config: &PollConfig,
    mut lookup: L,
    mut tick: T,
) -> Result<StatusSnapshot, KnownStateError<E>>
where
    L: FnMut(&str) -> Result<Option<String>, E>,
    T: FnMut() -> Result<(), E>,
{
    info!("Waiting for {:?} to be in '{}' state", names, READY_STATUS);

    let mut status: StatusSnapshot = names
        .iter()
        .map(|n| (n.clone(), Some(String::new())))
        .collect();

    let result = PollLoop::new(config.clone()).run(|_| {
        let mut latest = StatusSnapshot::new();
        for name in names {
            let s = lookup(name).map_err(KnownStateError::Lookup)?;
            latest.insert(name.clone(), s);
        }

        if latest != status {
            info!("latest status: {:?}", latest);
            status = latest;
        }

        let failed: Vec<String> = status
            .iter()
            .filter(|(_, s)| s.as_deref() == Some(ERROR_STATUS))
            .map(|(n, _)| n.clone())
            .collect();
        if !failed.is_empty() {
            return Err(KnownStateError::NodeError { failed });
        }

        tick().map_err(KnownStateError::Lookup)?;

        if status.values().all(|s| s.as_deref() == Some(READY_STATUS)) {
            Ok(Poll::Ready(status.clone()))
        } else {
            Ok(Poll::Pending)
        }
    });

    match result {
        Ok(snapshot) => Ok(snapshot),
        Err(PollError::Aborted(e)) => Err(e),
        Err(PollError::Exhausted { attempts }) | Err(PollError::DeadlineElapsed { attempts, .. }) => {
            Err(KnownStateError::Exhausted { attempts })
        }
    }
}
