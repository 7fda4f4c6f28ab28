#[cfg(test)]
mod tests {
    use rlm_core::{Message, RlmError};
    use rlm_llm::mock::{MockProvider, MockResponse};
    use rlm_llm::ratelimit::RateLimitConfig;
    use rlm_llm::router::{ModelRouter, RetryPolicy};
    use rlm_llm::{Gateway, GatewayOptions, RouterGateway};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn gateway_with(mock: MockProvider, options: GatewayOptions) -> RouterGateway {
        let mut router = ModelRouter::new().with_retry_policy(RetryPolicy::none());
        router.add_provider(Arc::new(mock));
        RouterGateway::new(router, options)
    }

    // ── send ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_send_returns_completion_text() {
        let mock = MockProvider::new("mock").with_response("42");
        let requests = mock.recorded_requests();
        let gateway = gateway_with(mock, GatewayOptions::default());

        let text = gateway.send("what is the answer?", "mock/m", None).await.unwrap();
        assert_eq!(text, "42");

        let recorded = requests.lock();
        assert_eq!(recorded[0].messages[0].content, "what is the answer?");
        assert_eq!(recorded[0].max_tokens, 4096);
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let mock = MockProvider::new("mock")
            .with_mock_response(MockResponse::text("late").delayed(Duration::from_millis(500)));
        let gateway = gateway_with(mock, GatewayOptions::default());

        let err = gateway
            .send("slow", "mock/m", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, RlmError::BackendTimeout { timeout_ms: 50 }));

        let stats = gateway.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let mock = MockProvider::new("mock").with_error("HTTP 400: bad request");
        let gateway = gateway_with(mock, GatewayOptions::default());

        let err = gateway.send("x", "mock/m", None).await.unwrap_err();
        assert!(matches!(err, RlmError::Backend(_)));
        assert_eq!(gateway.stats().timeouts, 0);
    }

    #[tokio::test]
    async fn test_stats_accumulate_usage() {
        let mock = MockProvider::new("mock").with_response("a").with_response("b");
        let gateway = gateway_with(mock, GatewayOptions::default());

        gateway.send("1", "mock/m", None).await.unwrap();
        gateway.send("2", "mock/m", None).await.unwrap();

        let stats = gateway.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.usage.input_tokens, 200);
        assert_eq!(stats.usage.output_tokens, 100);
    }

    // ── send_conversation ──────────────────────────────────────

    #[tokio::test]
    async fn test_conversation_keeps_turns_and_system() {
        let mock = MockProvider::new("mock").with_response("```repl\n{}\n```");
        let requests = mock.recorded_requests();
        let gateway = gateway_with(mock, GatewayOptions::default());

        let messages = vec![
            Message::user("query"),
            Message::assistant("thinking"),
            Message::user("report"),
        ];
        gateway
            .send_conversation(Some("controller prompt"), &messages, "mock/m", None)
            .await
            .unwrap();

        let recorded = requests.lock();
        assert_eq!(recorded[0].system.as_deref(), Some("controller prompt"));
        assert_eq!(recorded[0].messages.len(), 3);
    }

    // ── Shared limits ──────────────────────────────────────────

    #[tokio::test]
    async fn test_rate_limit_queues_instead_of_failing() {
        let mock = MockProvider::new("mock").with_responder(|_| MockResponse::text("ok"));
        let options = GatewayOptions {
            rate_limit: RateLimitConfig {
                burst: 1,
                refill_per_sec: 20.0,
            },
            ..Default::default()
        };
        let gateway = gateway_with(mock, options);

        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(gateway.send("x", "mock/m", None).await.unwrap(), "ok");
        }
        // Two refills at 20/s are needed after the first token.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_in_flight_limit_serializes_sends() {
        let mock = MockProvider::new("mock").with_responder(|_| {
            MockResponse::text("ok").delayed(Duration::from_millis(40))
        });
        let options = GatewayOptions {
            max_in_flight: 1,
            ..Default::default()
        };
        let gateway = Arc::new(gateway_with(mock, options));

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let gw = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move { gw.send("x", "mock/m", None).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(120));
    }
}
