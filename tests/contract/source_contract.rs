use std::sync::Arc;
use std::time::Duration;

use safra_core::{
    ExecutionContext, FailureKind, FetchError, FetchRequest, HttpError, HttpResponse, HttpSource,
    RateLimiter, ResilienceState, RetryConfig, ScriptedHttpClient, SourceDescriptor, SourceFetch,
    SourceOrchestrator,
};

struct SourceCase {
    name: &'static str,
    template: &'static str,
    request: FetchRequest,
    expected_url: &'static str,
}

fn source_cases() -> Vec<SourceCase> {
    vec![
        SourceCase {
            name: "cepea",
            template: "https://cepea.example.test/indicador/{key}.aspx",
            request: FetchRequest::new("boi gordo"),
            expected_url: "https://cepea.example.test/indicador/boi%20gordo.aspx",
        },
        SourceCase {
            name: "conab",
            template: "https://conab.example.test/precos?produto={key}",
            request: FetchRequest::new("milho").with_param("uf", "MT"),
            expected_url: "https://conab.example.test/precos?produto=milho&uf=MT",
        },
        SourceCase {
            name: "ibge",
            template: "https://sidra.example.test/t/{key}",
            request: FetchRequest::new("1612")
                .with_param("periodo", "2023")
                .with_param("nivel", "n3"),
            expected_url: "https://sidra.example.test/t/1612?nivel=n3&periodo=2023",
        },
    ]
}

fn http_source(case: &SourceCase, client: &Arc<ScriptedHttpClient>) -> HttpSource {
    HttpSource::new(Arc::clone(client) as Arc<dyn safra_core::HttpClient>, case.template)
}

#[tokio::test]
async fn success_returns_payload_and_provenance_for_all_sources() {
    let ctx = ExecutionContext::new().with_request_id("req-contract-1");

    for case in source_cases() {
        let client = Arc::new(ScriptedHttpClient::new([Ok(HttpResponse::ok("produto;valor"))]));
        let source = http_source(&case, &client);

        let output = source
            .fetch(&case.request, &ctx)
            .await
            .unwrap_or_else(|error| panic!("source '{}' fetch failed: {error}", case.name));

        assert_eq!(output.payload, b"produto;valor", "source '{}': payload", case.name);
        let metadata = output.metadata.expect("metadata present");
        assert_eq!(metadata["url"], case.expected_url, "source '{}': url", case.name);
        assert_eq!(metadata["status"], 200, "source '{}': status", case.name);

        let requests = client.requests();
        assert_eq!(requests.len(), 1, "source '{}': one request", case.name);
        assert_eq!(
            requests[0].headers.get("x-request-id").map(String::as_str),
            Some("req-contract-1"),
            "source '{}': request id propagated",
            case.name
        );
    }
}

#[tokio::test]
async fn failures_are_classified_identically_for_all_sources() {
    let ctx = ExecutionContext::new();

    for case in source_cases() {
        let scripted: Vec<(Result<HttpResponse, HttpError>, FailureKind, bool)> = vec![
            (Ok(HttpResponse::new(404, "not found")), FailureKind::Network, false),
            (Ok(HttpResponse::new(503, "maintenance")), FailureKind::Network, true),
            (
                Err(HttpError::Timeout {
                    after: Duration::from_secs(30),
                }),
                FailureKind::Network,
                true,
            ),
            (Err(HttpError::Connect(String::from("refused"))), FailureKind::Network, true),
        ];

        for (response, kind, retryable) in scripted {
            let client = Arc::new(ScriptedHttpClient::new([response]));
            let error = http_source(&case, &client)
                .fetch(&case.request, &ctx)
                .await
                .expect_err("scripted failure");

            assert_eq!(error.kind(), kind, "source '{}': {error}", case.name);
            assert_eq!(error.is_retryable(), retryable, "source '{}': {error}", case.name);
        }
    }
}

#[tokio::test]
async fn challenge_pages_are_hard_blocks_for_all_sources() {
    let ctx = ExecutionContext::new();

    for case in source_cases() {
        let client = Arc::new(ScriptedHttpClient::new([Ok(HttpResponse::new(
            403,
            "<html><title>Just a moment...</title></html>",
        )
        .with_header("CF-Ray", "8a1b2c3d"))]));

        let error = http_source(&case, &client)
            .fetch(&case.request, &ctx)
            .await
            .expect_err("blocked");

        assert_eq!(error, FetchError::hard_block(403, "cloudflare"), "source '{}'", case.name);
        assert!(!error.is_retryable(), "source '{}': blocks are not retried", case.name);
    }
}

#[tokio::test(start_paused = true)]
async fn transient_status_is_retried_through_the_orchestrator() {
    let state = Arc::new(ResilienceState::new(RateLimiter::new(Duration::ZERO)));
    let orchestrator =
        SourceOrchestrator::new(state).with_retry(RetryConfig::fixed(Duration::from_secs(1), 3));

    for case in source_cases() {
        let client = Arc::new(ScriptedHttpClient::new([
            Ok(HttpResponse::new(502, "bad gateway")),
            Ok(HttpResponse::ok("ok")),
        ]));
        let descriptor =
            SourceDescriptor::new(case.name, 1, Arc::new(http_source(&case, &client))).expect("descriptor");

        let resolution = orchestrator
            .resolve(&case.request, &[descriptor], &ExecutionContext::new())
            .await
            .unwrap_or_else(|error| panic!("source '{}' failed: {error}", case.name));

        assert_eq!(resolution.payload, b"ok", "source '{}'", case.name);
        assert!(resolution.attempts.failures.is_empty(), "source '{}'", case.name);
        assert_eq!(client.requests().len(), 2, "source '{}': retried once", case.name);
    }
}
