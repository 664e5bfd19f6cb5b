//! Shared fakes for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::clock::Clock;
use super::handler::ToolExecutor;

// ---------------------------------------------------------------------------
// CountingToolExecutor
// ---------------------------------------------------------------------------

/// Tool executor that records every call.
///
/// By default every tool succeeds with `{tool, args}`. Tools can be scripted
/// to fail always, fail a number of times first, or return a fixed value.
#[derive(Default)]
pub struct CountingToolExecutor {
    calls: Mutex<Vec<(String, Value)>>,
    failing: HashSet<String>,
    flaky: Mutex<HashMap<String, u32>>,
    responses: HashMap<String, Value>,
}

impl CountingToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, tool: &str) -> Self {
        self.failing.insert(tool.to_string());
        self
    }

    pub fn failing_times(self, tool: &str, times: u32) -> Self {
        self.flaky.lock().unwrap().insert(tool.to_string(), times);
        self
    }

    pub fn responding(mut self, tool: &str, value: Value) -> Self {
        self.responses.insert(tool.to_string(), value);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(n, _)| n == tool).count()
    }
}

impl ToolExecutor for CountingToolExecutor {
    fn execute_tool<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<Value, String>> {
        self.calls
            .lock()
            .unwrap()
            .push((tool_name.to_string(), args.clone()));

        let result = if self.failing.contains(tool_name) {
            Err(format!("{tool_name} unavailable"))
        } else {
            let mut flaky = self.flaky.lock().unwrap();
            match flaky.get_mut(tool_name) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(format!("{tool_name} transient failure"))
                }
                _ => Ok(self
                    .responses
                    .get(tool_name)
                    .cloned()
                    .unwrap_or_else(|| json!({ "tool": tool_name, "args": args }))),
            }
        };

        future::ready(result).boxed()
    }
}

// ---------------------------------------------------------------------------
// RecordingClock
// ---------------------------------------------------------------------------

/// Clock whose sleeps complete on first poll, advancing virtual time and
/// recording the requested duration.
///
/// Sleeps that are never polled (a timeout race the operation won) leave no
/// trace.
#[derive(Clone, Default)]
pub struct RecordingClock {
    inner: Arc<ClockState>,
}

#[derive(Default)]
struct ClockState {
    now_ms: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.inner.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.sleeps.lock().unwrap().clone()
    }
}

impl Clock for RecordingClock {
    fn now_ms(&self) -> u64 {
        self.inner.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(&self.inner);
        async move {
            inner.sleeps.lock().unwrap().push(duration);
            inner
                .now_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
        .boxed()
    }
}
