//! Task-local activation scope.
//!
//! Each activation runs inside a scope carrying a slot for its agent.
//! The binding is task-local: it survives every `.await` inside the
//! activation and is invisible to concurrently running activations, which
//! is what lets the probe route a record back to the agent of the
//! activation that issued the request.
//!
//! [`open`] creates the scope, [`Agent::new`](crate::Agent::new) registers
//! the agent through [`register_agent`], and the probe callback resolves
//! it with [`current_agent`] at emission time.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::agent::Agent;

tokio::task_local! {
    static ACTIVATION_SCOPE: ActivationScope;
}

/// Shared slot for the agent of the activation currently executing.
#[derive(Clone, Default)]
struct ActivationScope {
    agent: Arc<Mutex<Option<Agent>>>,
}

/// Runs a future inside a fresh activation scope.
///
/// Any agent registered while the future runs is visible to all of the
/// future's synchronous and asynchronous descendants, and to nothing
/// else. The scope is gone once the future resolves.
pub async fn open<F: Future>(fut: F) -> F::Output {
    ACTIVATION_SCOPE.scope(ActivationScope::default(), fut).await
}

/// Registers the agent on the open scope.
///
/// Outside a scope (library use without [`instrument`](crate::instrument))
/// this logs and does nothing; probe records will be dropped for lack of
/// an agent.
pub(crate) fn register_agent(agent: &Agent) {
    let registered = ACTIVATION_SCOPE.try_with(|scope| {
        let mut slot = match scope.agent.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(agent.clone());
    });
    if registered.is_err() {
        warn!("no activation scope open, agent not registered for http metrics");
    }
}

/// The agent of the currently executing activation, if any.
#[must_use]
pub fn current_agent() -> Option<Agent> {
    ACTIVATION_SCOPE
        .try_with(|scope| {
            let slot = match scope.agent.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.clone()
        })
        .ok()
        .flatten()
}
