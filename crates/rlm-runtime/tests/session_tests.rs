#[cfg(test)]
mod tests {
    use rlm_core::{FailureKind, SessionState};
    use rlm_llm::{GatewayOptions, LlmRequest, MockProvider, MockResponse, ModelRouter, RetryPolicy, RouterGateway};
    use rlm_runtime::prompts::NO_OPERATIONS_NOTICE;
    use rlm_runtime::{EngineSettings, RlmRuntime, SessionRequest, TraceOutcome};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const NEEDLE: &str = "NEEDLE-7Q2X-END";

    fn settings() -> EngineSettings {
        EngineSettings {
            model: "ctl/controller".into(),
            sub_model: "sub/worker".into(),
            max_depth: 1,
            call_timeout: Some(Duration::from_secs(5)),
            batch_timeout: Some(Duration::from_secs(10)),
            session_timeout: None,
            ..EngineSettings::default()
        }
    }

    /// Controller replies come from `controller`, sub-calls from `sub`.
    fn runtime_with(controller: MockProvider, sub: MockProvider, settings: EngineSettings) -> RlmRuntime {
        let mut router = ModelRouter::new().with_retry_policy(RetryPolicy::none());
        router.add_provider(Arc::new(controller));
        router.add_provider(Arc::new(sub));
        RlmRuntime::new(Arc::new(RouterGateway::new(router, GatewayOptions::default())), settings)
    }

    fn repl(ops: &[serde_json::Value]) -> String {
        let lines: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
        format!("Working on it.\n```repl\n{}\n```\n", lines.join("\n"))
    }

    fn last_user_message(request: &LlmRequest) -> &str {
        &request.messages[request.messages.len() - 1].content
    }

    #[tokio::test]
    async fn test_needle_search_end_to_end() {
        let mut text = ".".repeat(30_000);
        text.replace_range(14_000..14_015, NEEDLE);

        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[
                json!({"op": "plan_chunks", "chunk_size": 10000, "into": "plan"}),
                json!({"op": "llm_batch", "instruction": "Does the content contain a NEEDLE marker?", "plan": "plan", "into": "hits"}),
            ]))
            .with_response(&repl(&[json!({"op": "final_var", "name": "hits"})]));
        let controller_requests = controller.recorded_requests();
        let sub = MockProvider::new("sub").with_responder(|req| {
            if req.full_text().contains(NEEDLE) {
                MockResponse::text("found")
            } else {
                MockResponse::text("none")
            }
        });
        let runtime = runtime_with(controller, sub, settings());

        let output = runtime
            .run(SessionRequest::new(text, "Where is the needle?"))
            .await;

        assert_eq!(output.state, SessionState::Completed, "{:?}", output.error);
        assert_eq!(output.iterations, 2);
        assert_eq!(output.answer, Some(json!(["none", "found", "none"])));

        let ops: Vec<&str> = output.trace.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(ops.iter().filter(|op| **op == "call_sub_llm").count(), 3);
        assert!(ops.contains(&"plan_chunks"));
        assert!(ops.contains(&"llm_batch"));
        assert_eq!(*ops.last().unwrap(), "final_var");

        let requests = controller_requests.lock();
        assert_eq!(requests[0].model, "controller");
        assert!(requests[0].system.is_some());
        let first = last_user_message(&requests[0]);
        assert!(first.starts_with("Context: 30000 characters."));
        assert!(first.ends_with("Query: Where is the needle?"));
        let report = last_user_message(&requests[1]);
        assert!(report.contains("[1.1] plan_chunks: `plan` = "));
        assert!(report.contains("[1.2] llm_batch: `hits` = [\"none\",\"found\",\"none\"]"));
    }

    #[tokio::test]
    async fn test_reply_without_operations_gets_notice() {
        let controller = MockProvider::new("ctl")
            .with_response("Let me think about this.")
            .with_response("FINAL(42)");
        let requests = controller.recorded_requests();
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "answer?")).await;

        assert!(output.is_completed());
        assert_eq!(output.answer_text().as_deref(), Some("42"));
        assert_eq!(output.iterations, 2);
        assert_eq!(last_user_message(&requests.lock()[1]), NO_OPERATIONS_NOTICE);
    }

    #[tokio::test]
    async fn test_final_literal_answer() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({"op": "final", "answer": {"count": 3}})]));
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "count")).await;
        assert_eq!(output.answer, Some(json!({"count": 3})));
        assert_eq!(output.answer_text().as_deref(), Some("{\"count\":3}"));
    }

    #[tokio::test]
    async fn test_final_var_marker_after_block() {
        let reply = format!(
            "{}Done: FINAL_VAR(summary)",
            repl(&[json!({"op": "set_var", "name": "summary", "value": "all clear"})])
        );
        let controller = MockProvider::new("ctl").with_response(&reply);
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "status")).await;
        assert_eq!(output.answer, Some(json!("all clear")));
        assert_eq!(output.iterations, 1);
    }

    #[tokio::test]
    async fn test_operation_error_is_reported_and_block_skipped() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[
                json!({"op": "read_context", "start": -5, "end": 2}),
                json!({"op": "set_var", "name": "skipped", "value": 1}),
            ]))
            .with_response(&repl(&[
                json!({"op": "get_var", "name": "skipped", "default": "absent"}),
            ]))
            .with_response(&repl(&[json!({"op": "final", "answer": "done"})]));
        let requests = controller.recorded_requests();
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("abcdef", "q")).await;
        assert!(output.is_completed());
        assert_eq!(output.iterations, 3);

        let requests = requests.lock();
        let report = last_user_message(&requests[1]);
        assert!(report.starts_with("[1.1] read_context: error[invalid_request]: "));
        assert!(!report.contains("set_var"));
        assert_eq!(last_user_message(&requests[2]), "[1.1] get_var: absent");
    }

    #[tokio::test]
    async fn test_unparseable_operation_is_reported() {
        let controller = MockProvider::new("ctl")
            .with_response("```repl\n{\"op\": \"shell\", \"cmd\": \"ls\"}\n```")
            .with_response("FINAL(ok)");
        let requests = controller.recorded_requests();
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert!(output.is_completed());
        assert!(last_user_message(&requests.lock()[1]).contains("line 1"));
    }

    #[tokio::test]
    async fn test_long_outputs_are_truncated_in_report() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({"op": "read_context", "start": 0, "end": 10000})]))
            .with_response(&repl(&[json!({"op": "read_context", "start": 0, "end": 10000, "into": "all"})]))
            .with_response(&repl(&[json!({"op": "final_var", "name": "all"})]));
        let requests = controller.recorded_requests();
        let runtime = runtime_with(
            controller,
            MockProvider::new("sub"),
            EngineSettings {
                output_max_chars: 100,
                ..settings()
            },
        );

        let output = runtime.run(SessionRequest::new("z".repeat(10_000), "q")).await;
        assert!(last_user_message(&requests.lock()[1]).ends_with("[truncated 9900 of 10000 chars]"));
        assert_eq!(output.answer_text().unwrap().len(), 10_000);
    }

    #[tokio::test]
    async fn test_iteration_cap_is_a_safety_break() {
        let controller = MockProvider::new("ctl").with_responder(|_| {
            MockResponse::text("```repl\n{\"op\": \"get_var\", \"name\": \"x\"}\n```")
        });
        let runtime = runtime_with(
            controller,
            MockProvider::new("sub"),
            EngineSettings {
                max_iterations: 3,
                ..settings()
            },
        );

        let output = runtime.run(SessionRequest::new("ctx", "loop")).await;
        assert_eq!(output.state, SessionState::Failed);
        assert_eq!(output.failure, Some(FailureKind::SafetyBreak));
        assert_eq!(output.iterations, 3);
        assert!(output.answer.is_none());
    }

    #[tokio::test]
    async fn test_abort_operation_fails_session() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({"op": "abort", "reason": "context is binary"})]));
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert_eq!(output.state, SessionState::Failed);
        assert_eq!(output.failure, Some(FailureKind::SafetyBreak));
        assert!(output.error.unwrap().contains("context is binary"));
    }

    #[tokio::test]
    async fn test_missing_final_var_fails_session() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({"op": "final_var", "name": "nothing"})]));
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert_eq!(output.state, SessionState::Failed);
        assert_eq!(output.failure, Some(FailureKind::NoAnswer));
        assert_eq!(output.sessions.len(), 1);
        assert_eq!(output.sessions[0].id, output.session_id);
        assert_eq!(output.sessions[0].state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_depth_exceeded_at_root_fails_session() {
        let controller = MockProvider::new("ctl").with_response(&repl(&[json!({
            "op": "call_sub_llm", "instruction": "look", "content": {"start": 0, "end": 3}
        })]));
        let sub = MockProvider::new("sub");
        let sub_requests = sub.recorded_requests();
        let runtime = runtime_with(controller, sub, settings());

        let output = runtime
            .run(SessionRequest::new("ctx", "q").with_max_depth(0))
            .await;
        assert_eq!(output.state, SessionState::Failed);
        assert_eq!(output.failure, Some(FailureKind::DepthExceeded));
        assert!(sub_requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_depth_refused_batch_members_are_markers() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({
                "op": "llm_batch", "instruction": "look", "chunks": ["ab", "cd"], "into": "hits"
            })]))
            .with_response("FINAL(no sub-calls here)");
        let requests = controller.recorded_requests();
        let sub = MockProvider::new("sub");
        let sub_requests = sub.recorded_requests();
        let runtime = runtime_with(controller, sub, settings());

        let output = runtime
            .run(SessionRequest::new("ctx", "q").with_max_depth(0))
            .await;
        assert!(output.is_completed(), "{:?}", output.error);
        assert!(sub_requests.lock().is_empty());
        let report = last_user_message(&requests.lock()[1]).to_string();
        assert_eq!(report.matches("depth_exceeded").count(), 2);
    }

    #[tokio::test]
    async fn test_failed_sub_call_is_recoverable() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({
                "op": "call_sub_llm", "instruction": "look", "content": "abc", "into": "r"
            })]))
            .with_response("FINAL(gave up on sub-call)");
        let requests = controller.recorded_requests();
        let sub = MockProvider::new("sub").with_error("HTTP 500: boom");
        let runtime = runtime_with(controller, sub, settings());

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert!(output.is_completed());
        assert!(last_user_message(&requests.lock()[1]).contains("error[backend]"));
    }

    #[tokio::test]
    async fn test_nested_session_at_max_depth_two() {
        let controller = MockProvider::new("ctl")
            .with_response(&repl(&[json!({
                "op": "call_sub_llm",
                "instruction": "Summarize the first half",
                "content": {"start": 0, "end": 10},
                "into": "summary"
            })]))
            .with_response(&repl(&[json!({"op": "final_var", "name": "summary"})]));
        // Depth 1 runs its own Controller loop on the sub model; depth 2 is a leaf.
        let sub = MockProvider::new("sub").with_responder(|req| {
            if req.system.is_none() {
                return MockResponse::text("leaf-answer");
            }
            if req.messages.len() == 1 {
                MockResponse::text(
                    "```repl\n{\"op\": \"call_sub_llm\", \"instruction\": \"inner\", \"content\": {\"start\": 0, \"end\": 5}, \"into\": \"r\"}\n```",
                )
            } else {
                MockResponse::text("FINAL_VAR(r)")
            }
        });
        let runtime = runtime_with(
            controller,
            sub,
            EngineSettings {
                max_depth: 2,
                ..settings()
            },
        );

        let output = runtime.run(SessionRequest::new("0123456789abcdefghij", "q")).await;
        assert_eq!(output.state, SessionState::Completed, "{:?}", output.error);
        assert_eq!(output.answer, Some(json!("leaf-answer")));

        let tree = &output.sessions;
        let mut depths: Vec<u32> = tree.iter().map(|r| r.depth).collect();
        depths.sort();
        assert_eq!(depths, vec![0, 1, 2]);
        assert!(tree.iter().all(|r| r.state == SessionState::Completed));

        let nested_call = output
            .trace
            .iter()
            .find(|e| e.depth == 1 && e.operation == "call_sub_llm")
            .unwrap();
        assert!(nested_call.child_session.is_some());
        assert_eq!(nested_call.args["content_chars"], json!(5));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_session() {
        let controller = MockProvider::new("ctl")
            .with_mock_response(MockResponse::text("FINAL(late)").delayed(Duration::from_secs(5)));
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let output = runtime
            .run_with_cancel(SessionRequest::new("ctx", "q"), cancel)
            .await;

        assert_eq!(output.state, SessionState::Aborted);
        assert_eq!(output.failure, Some(FailureKind::Aborted));
    }

    #[tokio::test]
    async fn test_session_timeout_aborts_session() {
        let controller = MockProvider::new("ctl")
            .with_mock_response(MockResponse::text("FINAL(late)").delayed(Duration::from_secs(5)));
        let runtime = runtime_with(
            controller,
            MockProvider::new("sub"),
            EngineSettings {
                call_timeout: None,
                session_timeout: Some(Duration::from_millis(100)),
                ..settings()
            },
        );

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert_eq!(output.state, SessionState::Aborted);
        assert!(output.error.unwrap().contains("session timeout"));
    }

    #[tokio::test]
    async fn test_session_timeout_settles_in_flight_batch() {
        let controller = MockProvider::new("ctl").with_response(&repl(&[json!({
            "op": "llm_batch", "instruction": "scan", "chunks": ["abc", "def"], "into": "hits"
        })]));
        let sub = MockProvider::new("sub")
            .with_responder(|_| MockResponse::text("slow").delayed(Duration::from_secs(5)));
        let runtime = runtime_with(
            controller,
            sub,
            EngineSettings {
                call_timeout: None,
                session_timeout: Some(Duration::from_millis(100)),
                ..settings()
            },
        );

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert_eq!(output.state, SessionState::Aborted);
        assert!(output.error.as_deref().unwrap().contains("session timeout"));

        let calls: Vec<_> = output
            .trace
            .iter()
            .filter(|e| e.operation == "call_sub_llm")
            .collect();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|e| matches!(
            e.outcome,
            TraceOutcome::Error { kind: FailureKind::Aborted, .. }
        )));
        assert!(output.trace.iter().any(|e| e.operation == "llm_batch"));

        assert_eq!(output.sessions.len(), 3);
        assert!(output.sessions.iter().all(|r| r.state == SessionState::Aborted));
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    async fn test_registry_released_after_each_run() {
        let controller = MockProvider::new("ctl").with_responder(|_| MockResponse::text("FINAL(done)"));
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        for _ in 0..50 {
            let output = runtime.run(SessionRequest::new("ctx", "q")).await;
            assert!(output.is_completed());
            assert_eq!(output.sessions.len(), 1);
        }
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    async fn test_controller_backend_failure_fails_session() {
        let controller = MockProvider::new("ctl").with_error("HTTP 401: unauthorized");
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        assert_eq!(output.state, SessionState::Failed);
        assert_eq!(output.failure, Some(FailureKind::Backend));
    }

    #[tokio::test]
    async fn test_session_output_serializes() {
        let controller = MockProvider::new("ctl").with_response("FINAL(yes)");
        let runtime = runtime_with(controller, MockProvider::new("sub"), settings());

        let output = runtime.run(SessionRequest::new("ctx", "q")).await;
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["state"], json!("completed"));
        assert_eq!(value["answer"], json!("yes"));
        assert!(value["trace"].is_array());
        assert_eq!(value["sessions"][0]["state"], json!("completed"));
    }
}
