//! Resolution of one round of model-requested function calls.

use crate::{
    generic_types::{FunctionCall, FunctionResponse},
    tools::{ToolCall, ToolCallStatus, ToolRuntime},
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, instrument, warn};

/// Error text returned to the model when the user refuses a dangerous call.
pub const DECLINED_BY_USER: &str = "The user declined to run this action.";

/// Executes function calls against the local tool runtime.
///
/// Calls inside a round are executed one at a time in arrival order, and the
/// round resolves to one response per call in that same order. Failures are
/// never raised: a tool error or a declined confirmation becomes a
/// `{success: false, error}` result for the model.
pub struct ToolCallOrchestrator {
    runtime: ToolRuntime,
    next_id: AtomicU64,
}

impl ToolCallOrchestrator {
    pub fn new(runtime: ToolRuntime) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn runtime(&self) -> &ToolRuntime {
        &self.runtime
    }

    /// Resolves every call of a round and returns the batched responses.
    #[instrument(skip_all, fields(calls = calls.len()))]
    pub async fn resolve_round(&self, calls: Vec<FunctionCall>) -> Vec<FunctionResponse> {
        let mut responses = Vec::with_capacity(calls.len());
        for call in calls {
            let wire_id = call.id.clone();
            let name = call.name.clone();
            let result = self.resolve_call(call).await;
            responses.push(FunctionResponse {
                id: wire_id,
                name,
                response: result,
            });
        }
        responses
    }

    async fn resolve_call(&self, call: FunctionCall) -> Value {
        let mut record = ToolCall {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: call.name,
            args: call.args,
            status: ToolCallStatus::Pending,
            result: None,
        };
        self.notify(&record);

        if self.runtime.policy.is_dangerous(&record.name) {
            record.status = ToolCallStatus::AwaitingConfirmation;
            self.notify(&record);

            let prompt = self.runtime.policy.describe(&record.name, &record.args);
            if !self.runtime.gate.confirm(&prompt).await {
                info!(tool = %record.name, "User declined dangerous tool call");
                return self.finish(record, failure(DECLINED_BY_USER));
            }
        }

        record.status = ToolCallStatus::Executing;
        self.notify(&record);

        match self.runtime.executor.execute(&record.name, &record.args).await {
            Ok(payload) => {
                info!(tool = %record.name, id = record.id, "Tool call completed");
                self.finish(record, json!({ "result": payload }))
            }
            Err(e) => {
                warn!(tool = %record.name, id = record.id, error = %e, "Tool call failed");
                self.finish(record, failure(&e.to_string()))
            }
        }
    }

    fn finish(&self, mut record: ToolCall, result: Value) -> Value {
        record.status = if is_failure(&result) {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };
        record.result = Some(result.clone());
        self.notify(&record);
        result
    }

    fn notify(&self, record: &ToolCall) {
        if let Some(observer) = &self.runtime.observer {
            observer.on_tool_call(record);
        }
    }
}

fn failure(message: &str) -> Value {
    json!({ "success": false, "error": message })
}

fn is_failure(result: &Value) -> bool {
    result.get("success") == Some(&Value::Bool(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ToolError,
        tools::{MockConfirmationGate, MockToolExecutor, ToolObserver},
    };
    use serde_json::Map;
    use std::sync::{Arc, Mutex};

    fn call(name: &str) -> FunctionCall {
        FunctionCall {
            id: Some(format!("id-{name}")),
            name: name.to_string(),
            args: Map::new(),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, ToolCallStatus)>>);

    impl ToolObserver for Recorder {
        fn on_tool_call(&self, call: &ToolCall) {
            self.0.lock().unwrap().push((call.name.clone(), call.status));
        }
    }

    #[tokio::test]
    async fn round_preserves_call_order_and_count() {
        let mut executor = MockToolExecutor::new();
        executor
            .expect_execute()
            .times(3)
            .returning(|name, _| Ok(json!(format!("ran {name}"))));
        let runtime = ToolRuntime::new(Arc::new(executor), Arc::new(MockConfirmationGate::new()));
        let orchestrator = ToolCallOrchestrator::new(runtime);

        let responses = orchestrator
            .resolve_round(vec![call("first"), call("second"), call("third")])
            .await;

        let names: Vec<_> = responses.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert_eq!(responses[1].id.as_deref(), Some("id-second"));
        assert_eq!(responses[2].response, json!({"result": "ran third"}));
    }

    #[tokio::test]
    async fn declined_dangerous_call_never_reaches_executor() {
        let mut executor = MockToolExecutor::new();
        executor.expect_execute().never();
        let mut gate = MockConfirmationGate::new();
        gate.expect_confirm()
            .withf(|prompt| prompt.contains("delete_file"))
            .times(1)
            .returning(|_| false);
        let orchestrator =
            ToolCallOrchestrator::new(ToolRuntime::new(Arc::new(executor), Arc::new(gate)));

        let responses = orchestrator.resolve_round(vec![call("delete_file")]).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response["success"], json!(false));
        assert_eq!(responses[0].response["error"], json!(DECLINED_BY_USER));
    }

    #[tokio::test]
    async fn confirmed_dangerous_call_executes() {
        let mut executor = MockToolExecutor::new();
        executor
            .expect_execute()
            .withf(|name, _| name == "send_email")
            .times(1)
            .returning(|_, _| Ok(json!({"sent": true})));
        let mut gate = MockConfirmationGate::new();
        gate.expect_confirm().times(1).returning(|_| true);
        let orchestrator =
            ToolCallOrchestrator::new(ToolRuntime::new(Arc::new(executor), Arc::new(gate)));

        let responses = orchestrator.resolve_round(vec![call("send_email")]).await;
        assert_eq!(responses[0].response, json!({"result": {"sent": true}}));
    }

    #[tokio::test]
    async fn tool_errors_become_structured_failures_and_round_continues() {
        let mut executor = MockToolExecutor::new();
        executor
            .expect_execute()
            .withf(|name, _| name == "broken")
            .returning(|_, _| Err(ToolError::Failed("disk on fire".into())));
        executor
            .expect_execute()
            .withf(|name, _| name == "fine")
            .returning(|_, _| Ok(json!(42)));
        let orchestrator = ToolCallOrchestrator::new(ToolRuntime::new(
            Arc::new(executor),
            Arc::new(MockConfirmationGate::new()),
        ));

        let responses = orchestrator
            .resolve_round(vec![call("broken"), call("fine")])
            .await;

        assert_eq!(
            responses[0].response,
            json!({"success": false, "error": "disk on fire"})
        );
        assert_eq!(responses[1].response, json!({"result": 42}));
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        let mut executor = MockToolExecutor::new();
        executor.expect_execute().returning(|_, _| Ok(json!(null)));
        let mut gate = MockConfirmationGate::new();
        gate.expect_confirm().returning(|_| true);
        let recorder = Arc::new(Recorder::default());
        let runtime = ToolRuntime::new(Arc::new(executor), Arc::new(gate))
            .with_observer(recorder.clone());
        let orchestrator = ToolCallOrchestrator::new(runtime);

        orchestrator
            .resolve_round(vec![call("get_time"), call("delete_file")])
            .await;

        let seen = recorder.0.lock().unwrap().clone();
        let statuses: Vec<_> = seen.iter().map(|(_, s)| *s).collect();
        assert_eq!(
            statuses,
            [
                ToolCallStatus::Pending,
                ToolCallStatus::Executing,
                ToolCallStatus::Completed,
                ToolCallStatus::Pending,
                ToolCallStatus::AwaitingConfirmation,
                ToolCallStatus::Executing,
                ToolCallStatus::Completed,
            ]
        );
    }
}
