/// Bounded, immediate retry without backoff.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { error: E, attempts: u32 },
    /// The classifier rejected the error; no further attempt was made.
    Aborted { error: E, attempts: u32 },
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    #[must_use]
    pub const fn once() -> Self {
        Self::new(1)
    }

    /// Runs `op` until it succeeds, fails with an error `is_retryable`
    /// rejects, or `max_retries` extra attempts are used up.
    ///
    /// `op` receives the zero-based attempt number.
    pub fn run<T, E, C, F>(&self, is_retryable: C, mut op: F) -> RetryOutcome<T, E>
    where
        C: Fn(&E) -> bool,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 0_u32;
        loop {
            let attempts = attempt + 1;
            match op(attempt) {
                Ok(value) => return RetryOutcome::Success { value, attempts },
                Err(error) if !is_retryable(&error) => {
                    return RetryOutcome::Aborted { error, attempts }
                }
                Err(error) if attempt >= self.max_retries => {
                    return RetryOutcome::Exhausted { error, attempts }
                }
                Err(_) => attempt += 1,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Eq, PartialEq)]
    enum Failure {
        Transient,
        Fatal,
    }

    fn transient(error: &Failure) -> bool {
        matches!(error, Failure::Transient)
    }

    #[test]
    fn first_success_needs_one_attempt() {
        let outcome = RetryPolicy::once().run(transient, |_| Ok::<_, Failure>(7));
        assert_eq!(
            outcome,
            RetryOutcome::Success {
                value: 7,
                attempts: 1
            }
        );
    }

    #[test]
    fn transient_failure_is_retried_once() {
        let mut seen = Vec::new();
        let outcome = RetryPolicy::once().run(transient, |attempt| {
            seen.push(attempt);
            if attempt == 0 {
                Err(Failure::Transient)
            } else {
                Ok("recovered")
            }
        });

        assert_eq!(seen, vec![0, 1]);
        assert_eq!(
            outcome,
            RetryOutcome::Success {
                value: "recovered",
                attempts: 2
            }
        );
    }

    #[test]
    fn repeated_transient_failure_is_exhausted() {
        let mut calls = 0;
        let outcome = RetryPolicy::once().run(transient, |_| {
            calls += 1;
            Err::<(), _>(Failure::Transient)
        });

        assert_eq!(calls, 2);
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                error: Failure::Transient,
                attempts: 2
            }
        );
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let mut calls = 0;
        let outcome = RetryPolicy::new(3).run(transient, |_| {
            calls += 1;
            Err::<(), _>(Failure::Fatal)
        });

        assert_eq!(calls, 1);
        assert_eq!(
            outcome,
            RetryOutcome::Aborted {
                error: Failure::Fatal,
                attempts: 1
            }
        );
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let outcome = RetryPolicy::new(0).run(transient, |_| Err::<(), _>(Failure::Transient));
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
    }
}
