// Copyright 2024 Neatx Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Two distinct exponential-backoff retry loops recur in the broker: a
//! node-socket **connect retry** (tight start, slow ×1.1 growth, no
//! per-step cap, ~10s budget, retries only on the connection-refused
//! family of errors) and a session-**readiness poll retry** (same start,
//! faster ×1.5 growth, 1s per-step cap, a 30s or 60s budget depending on
//! the caller). Keeping them as separate, named constructors rather than
//! one do-everything function prevents the two shapes from blurring into
//! each other at a call site.
//!
//! Sleeping is injected through the [`Clock`] trait so tests can run a
//! full backoff schedule without actually waiting on it.

use std::time::{Duration, Instant};

use anyhow::bail;

use crate::consts;

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);
}

/// The real clock, used by every non-test caller.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// What an individual retry attempt decided.
pub enum Step<T> {
    Done(T),
    Retry,
}

/// Runs `attempt` in a loop with exponential backoff until it returns
/// [`Step::Done`], a non-retryable error, or the budget is exhausted.
pub fn run<T>(
    clock: &dyn Clock,
    start: Duration,
    growth: f64,
    step_cap: Option<Duration>,
    budget: Duration,
    mut attempt: impl FnMut() -> anyhow::Result<Step<T>>,
) -> anyhow::Result<T> {
    let deadline = clock.now() + budget;
    let mut delay = start;

    loop {
        if let Step::Done(value) = attempt()? {
            return Ok(value);
        }

        if clock.now() >= deadline {
            bail!("retry budget of {:?} exceeded", budget);
        }

        clock.sleep(delay);

        let mut next = Duration::from_secs_f64(delay.as_secs_f64() * growth);
        if let Some(cap) = step_cap {
            next = next.min(cap);
        }
        delay = next;
    }
}

/// The node-socket connect retry shape (§4.4/§5): 100ms start, ×1.1
/// growth, no per-step cap, 10s budget.
pub fn connect_retry<T>(
    clock: &dyn Clock,
    attempt: impl FnMut() -> anyhow::Result<Step<T>>,
) -> anyhow::Result<T> {
    run(clock, consts::CONNECT_RETRY_START, consts::CONNECT_RETRY_GROWTH, None, consts::CONNECT_RETRY_BUDGET, attempt)
}

/// The session-readiness poll retry shape (§4.4/§5): 100ms start, ×1.5
/// growth, 1s per-step cap, 30s (start) or 60s (restore) budget.
pub fn readiness_retry<T>(
    clock: &dyn Clock,
    budget: Duration,
    attempt: impl FnMut() -> anyhow::Result<Step<T>>,
) -> anyhow::Result<T> {
    run(
        clock,
        consts::READY_RETRY_START,
        consts::READY_RETRY_GROWTH,
        Some(consts::READY_RETRY_STEP_CAP),
        budget,
        attempt,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;

    /// A clock that doesn't actually sleep but advances a virtual `now`
    /// by the requested amount, so backoff-schedule tests run instantly.
    struct FakeClock {
        now: RefCell<Instant>,
    }

    impl FakeClock {
        fn new() -> Self {
            FakeClock { now: RefCell::new(Instant::now()) }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.borrow()
        }

        fn sleep(&self, d: Duration) {
            *self.now.borrow_mut() += d;
        }
    }

    #[test]
    fn succeeds_on_first_attempt_without_sleeping() {
        let clock = FakeClock::new();
        let got = connect_retry(&clock, || Ok(Step::Done(42))).unwrap();
        assert_eq!(got, 42);
    }

    #[test]
    fn retries_until_done() {
        let clock = FakeClock::new();
        let mut attempts = 0;
        let got = readiness_retry(&clock, Duration::from_secs(30), || {
            attempts += 1;
            if attempts < 3 {
                Ok(Step::Retry)
            } else {
                Ok(Step::Done("waiting"))
            }
        })
        .unwrap();
        assert_eq!(got, "waiting");
        assert_eq!(attempts, 3);
    }

    #[test]
    fn budget_exhaustion_is_an_error() {
        let clock = FakeClock::new();
        let err = readiness_retry::<()>(&clock, Duration::from_secs(1), || Ok(Step::Retry)).unwrap_err();
        assert!(err.to_string().contains("retry budget"));
    }

    #[test]
    fn non_retryable_error_propagates_immediately() {
        let clock = FakeClock::new();
        let mut attempts = 0;
        let err = connect_retry::<()>(&clock, || {
            attempts += 1;
            bail!("ECONNREFUSED is not one of the retryable kinds this time")
        })
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(err.to_string().contains("not one of the retryable"));
    }
}
