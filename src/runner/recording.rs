//! Recording invoker for dry runs and tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::invocation::ToolInvocation;
use super::invoker::{InvocationOutcome, ToolInvoker};
use crate::error::ToolError;

/// Invoker that records commands instead of executing them.
///
/// Used by `--dry-run` to print the full command plan, and by tests as a
/// scripted stand-in for the toolkit. A failure can be injected at a given
/// call position or for a given program.
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<ToolInvocation>>,
    fail_at_call: Option<(usize, i32)>,
    fail_on_program: Option<(String, i32)>,
}

impl RecordingInvoker {
    /// Creates an invoker where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the call with the given 1-based position.
    pub fn failing_at_call(mut self, position: usize, code: i32) -> Self {
        self.fail_at_call = Some((position, code));
        self
    }

    /// Fails every call to `program`.
    pub fn failing_on_program(mut self, program: impl Into<String>, code: i32) -> Self {
        self.fail_on_program = Some((program.into(), code));
        self
    }

    /// Returns a copy of all invocations seen so far, in call order.
    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Number of invocations seen so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ToolInvoker for RecordingInvoker {
    async fn run(&self, invocation: &ToolInvocation) -> Result<InvocationOutcome, ToolError> {
        let position = {
            let mut calls = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            calls.push(invocation.clone());
            calls.len()
        };

        info!(tool = %invocation.program, position, "[dry-run] {}", invocation.display_command());

        let injected = match (&self.fail_at_call, &self.fail_on_program) {
            (Some((at, code)), _) if *at == position => Some(*code),
            (_, Some((program, code))) if *program == invocation.program => Some(*code),
            _ => None,
        };

        match injected {
            Some(code) => Err(ToolError::NonZeroExit {
                program: invocation.program.clone(),
                code,
                stderr: format!("injected failure at call {}", position),
            }),
            None => Ok(InvocationOutcome::new(&invocation.program, Duration::ZERO)),
        }
    }
}
