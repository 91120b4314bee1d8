use crate::state::mutate_state;

#[derive(Debug, PartialEq, Eq)]
pub enum GuardError {
    AlreadyProcessing,
}

/// Marks the engine as busy with a protected operation for as long as the
/// value is alive. Every mutating flow holds one across its external calls,
/// so a ledger callback re-entering the canister mid-flight cannot start a
/// second protected operation: it fails immediately instead of observing
/// half-applied state.
#[must_use]
pub struct OperationGuard(());

impl OperationGuard {
    /// Attempts to mark the engine busy. Fails if another protected
    /// operation is already in flight.
    pub fn new() -> Result<Self, GuardError> {
        mutate_state(|s| {
            if s.operation_in_flight {
                return Err(GuardError::AlreadyProcessing);
            }
            s.operation_in_flight = true;
            Ok(OperationGuard(()))
        })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // The flag must clear on every exit path, success or failure.
        mutate_state(|s| {
            s.operation_in_flight = false;
        });
    }
}

#[must_use]
pub struct FetchRateGuard(());

impl FetchRateGuard {
    pub fn new() -> Option<Self> {
        mutate_state(|s| {
            if s.is_fetching_rates {
                return None;
            }
            s.is_fetching_rates = true;
            Some(FetchRateGuard(()))
        })
    }
}

impl Drop for FetchRateGuard {
    fn drop(&mut self) {
        mutate_state(|s| {
            s.is_fetching_rates = false;
        });
    }
}
