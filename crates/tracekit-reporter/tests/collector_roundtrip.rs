//! End-to-end exercise of the reporter against a mock collector speaking the
//! real HTTP wire format.

use std::time::Duration;

use httptest::{matchers::request, responders::json_encoded, Expectation, Server};
use serde_json::json;

use tracekit_reporter::{AgentConfig, Reporter, RpcReporter, ServiceKey};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ok_result() -> serde_json::Value {
    json!({ "result": "OK", "arg": "" })
}

fn config_for(server: &Server) -> AgentConfig {
    let mut config = AgentConfig::new(ServiceKey::parse("1234567890abcdef:roundtrip").unwrap());
    // The mock server speaks plain HTTP; the address keeps its scheme.
    config.collector = server.url_str("").trim_end_matches('/').to_string();
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn events_reach_the_collector() {
    init_logging();
    let server = Server::run();
    // Both connections announce themselves before anything else.
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/post_status"))
            .times(2..)
            .respond_with(json_encoded(ok_result())),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/post_events"))
            .times(1..)
            .respond_with(json_encoded(ok_result())),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/get_settings"))
            .times(0..)
            .respond_with(json_encoded(json!({
                "result": "OK",
                "arg": "",
                "settings": [],
            }))),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/post_metrics"))
            .times(0..)
            .respond_with(json_encoded(ok_result())),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/ping"))
            .times(0..)
            .respond_with(json_encoded(ok_result())),
    );

    let reporter = RpcReporter::start(config_for(&server))
        .await
        .expect("reporter failed to start");

    for i in 0..5u8 {
        reporter
            .report_event(vec![0xde, 0xad, i])
            .expect("event enqueue failed");
    }

    // Give the idle trigger a chance to assemble and deliver the batch.
    tokio::time::sleep(Duration::from_secs(1)).await;

    reporter.shutdown();
    // Dropping the server verifies the expectations, post_events included.
}

#[tokio::test(flavor = "multi_thread")]
async fn sampling_works_against_a_live_collector() {
    init_logging();
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/post_status"))
            .times(2..)
            .respond_with(json_encoded(ok_result())),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/get_settings"))
            .times(0..)
            .respond_with(json_encoded(json!({
                "result": "OK",
                "arg": "",
                "settings": [],
            }))),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/post_metrics"))
            .times(0..)
            .respond_with(json_encoded(ok_result())),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/rpc/ping"))
            .times(0..)
            .respond_with(json_encoded(ok_result())),
    );

    let reporter = RpcReporter::start(config_for(&server))
        .await
        .expect("reporter failed to start");

    // Default policy samples everything; the token bucket caps admissions.
    let decision = reporter.should_sample("web", None);
    assert_eq!(decision.rate, tracekit_reporter::SAMPLE_RATE_SCALE);

    let continued = reporter.should_sample("web", Some("upstream-id"));
    assert!(continued.sampled);

    reporter.shutdown();
}
