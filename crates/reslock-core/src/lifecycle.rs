use crate::CoreError;
use reslock_schema::types::ResolveName;
use std::fmt;

/// State of one solve invocation for one resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolveState {
    Pending,
    Solving,
    Succeeded,
    Failed,
}

impl SolveState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SolveState::Succeeded | SolveState::Failed)
    }
}

impl fmt::Display for SolveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveState::Pending => write!(f, "pending"),
            SolveState::Solving => write!(f, "solving"),
            SolveState::Succeeded => write!(f, "succeeded"),
            SolveState::Failed => write!(f, "failed"),
        }
    }
}

pub fn validate_transition(from: SolveState, to: SolveState) -> Result<(), CoreError> {
    // Solving -> Solving is a retry after a transport failure.
    let valid = matches!(
        (from, to),
        (SolveState::Pending | SolveState::Solving, SolveState::Solving)
            | (SolveState::Solving, SolveState::Succeeded | SolveState::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Tracks the state machine of one solve and counts backend attempts.
#[derive(Debug, Clone)]
pub struct SolveAttempt {
    resolve: ResolveName,
    state: SolveState,
    attempts: u32,
}

impl SolveAttempt {
    pub fn new(resolve: ResolveName) -> Self {
        Self {
            resolve,
            state: SolveState::Pending,
            attempts: 0,
        }
    }

    pub fn resolve(&self) -> &ResolveName {
        &self.resolve
    }

    pub fn state(&self) -> SolveState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transition(&mut self, to: SolveState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        if to == SolveState::Solving {
            self.attempts += 1;
        }
        tracing::debug!(
            "resolve '{}': {} -> {} (attempt {})",
            self.resolve,
            self.state,
            to,
            self.attempts
        );
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(SolveState::Pending, SolveState::Solving).is_ok());
        assert!(validate_transition(SolveState::Solving, SolveState::Solving).is_ok());
        assert!(validate_transition(SolveState::Solving, SolveState::Succeeded).is_ok());
        assert!(validate_transition(SolveState::Solving, SolveState::Failed).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(SolveState::Pending, SolveState::Succeeded).is_err());
        assert!(validate_transition(SolveState::Pending, SolveState::Failed).is_err());
        assert!(validate_transition(SolveState::Succeeded, SolveState::Solving).is_err());
        assert!(validate_transition(SolveState::Failed, SolveState::Solving).is_err());
        assert!(validate_transition(SolveState::Succeeded, SolveState::Pending).is_err());
        assert!(validate_transition(SolveState::Failed, SolveState::Succeeded).is_err());
    }

    #[test]
    fn attempt_counts_retries() {
        let mut attempt = SolveAttempt::new(ResolveName::new("web"));
        attempt.transition(SolveState::Solving).unwrap();
        attempt.transition(SolveState::Solving).unwrap();
        attempt.transition(SolveState::Succeeded).unwrap();
        assert_eq!(attempt.attempts(), 2);
        assert!(attempt.state().is_terminal());
        assert!(attempt.transition(SolveState::Solving).is_err());
    }
}
