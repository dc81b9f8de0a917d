//! Start/Stop/Error instrumentation around a unit of work.
//!
//! [`TelemetryLogger::log_telemetry`] brackets a closure with a
//! `<prefix>Start` event, a `<prefix>Error` event when the closure fails,
//! and a `<prefix>Stop` event carrying the measured duration:
//!
//! ```ignore
//! let result = logger.log_telemetry(&EventId::named("ProcessExecute"), &event, None, || {
//!     run_workload()
//! });
//! ```

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use futures::FutureExt;

use crate::event::Event;
use crate::logger::{TelemetryLogger, panic_message};
use crate::sampling::SamplingOptions;
use crate::types::{EventId, Severity};

type Outcome<T, E> = thread::Result<Result<T, E>>;

impl TelemetryLogger {
    /// Runs `body` between Start and Stop events.
    ///
    /// When `sampling` is given and the current invocation is not sampled,
    /// `body` runs exactly once and nothing is emitted. Either way the
    /// sampling counter advances by one. A panic in `body` is reported as
    /// an Error event and then resumed.
    pub fn log_telemetry<T, E, F>(
        &self,
        prefix: &EventId,
        event: &Event,
        sampling: Option<&SamplingOptions>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        let _count = sampling.map(SamplingOptions::count_on_drop);
        if sampling.is_some_and(|s| !s.sample()) {
            return body();
        }

        self.emit(&prefix.suffixed("Start"), Severity::Information, event);
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        self.finish(prefix, event, started, outcome)
    }

    /// Async form of [`TelemetryLogger::log_telemetry`].
    pub async fn log_telemetry_async<T, E, Fut>(
        &self,
        prefix: &EventId,
        event: &Event,
        sampling: Option<&SamplingOptions>,
        body: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let _count = sampling.map(SamplingOptions::count_on_drop);
        if sampling.is_some_and(|s| !s.sample()) {
            return body.await;
        }

        self.emit(&prefix.suffixed("Start"), Severity::Information, event);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        self.finish(prefix, event, started, outcome)
    }

    fn finish<T, E>(
        &self,
        prefix: &EventId,
        event: &Event,
        started: Instant,
        outcome: Outcome<T, E>,
    ) -> Result<T, E>
    where
        E: fmt::Display,
    {
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match &outcome {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                let failed = event.clone().with_error(type_name::<E>(), &err.to_string());
                self.emit(&prefix.suffixed("Error"), Severity::Error, &failed);
            }
            Err(payload) => {
                let failed = event
                    .clone()
                    .with_error("panic", &panic_message(payload.as_ref()));
                self.emit(&prefix.suffixed("Error"), Severity::Error, &failed);
            }
        }

        let stopped = event.clone().with_duration_ms(elapsed_ms);
        self.emit(&prefix.suffixed("Stop"), Severity::Information, &stopped);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
