use crate::error::TransitionError;
use crate::types::{Lifecycle, NodeKey};

/// Validates a lifecycle transition.
///
/// Illegal transitions indicate an engine bug; with the `strict-debug`
/// feature they panic instead of returning an error.
pub fn validate_transition(
    key: &NodeKey,
    from: Lifecycle,
    to: Lifecycle,
) -> Result<(), TransitionError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal lifecycle transition for {key}: {from:?} -> {to:?}");

        #[allow(unreachable_code)]
        Err(TransitionError {
            key: key.clone(),
            from,
            to,
        })
    }
}

pub fn allowed_transitions(from: Lifecycle) -> Vec<Lifecycle> {
    use Lifecycle::*;
    match from {
        Pending => vec![Blocked, Running, Skipped],
        Blocked => vec![Running, Skipped],
        Running => vec![Settling, Failed],
        Settling => vec![Settled, Failed],
        Settled => vec![],
        Failed => vec![],
        Skipped => vec![],
    }
}

fn allowed(from: Lifecycle, to: Lifecycle) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
