//! `POST /`: run a report and return its result.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use common::error::BoxError;
use common::{RunRequest, RunResponse, ServiceError, JSON_CONTENT_TYPE};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Collected, LengthLimitError, Limited};

use super::state::AppState;
use crate::log::{Fields, Log};
use crate::report::ReportError;
use crate::router::{json, HandlerResult, RequestBody};

/// Validate the request, run the named report and respond with
/// `{"result": ...}`.
///
/// Requires `content-type: application/json` (415 otherwise) and a body of
/// the form `{"report": "<id>", "parameters": <any>}` (400 otherwise). A
/// report outside the reports directory is a 400; any other report failure
/// is a 500.
pub(super) async fn run(state: AppState, request: Request<RequestBody>, log: Log) -> HandlerResult {
    check_content_type(request.headers())?;
    let body = read_body(request.into_body(), state.body_limit).await?;
    let req = RunRequest::from_body(&body)?;

    log.info(Fields::new().with("body", &req), "Running report ...");
    let result = state
        .runner
        .run(&req.report, req.parameters.clone())
        .await
        .map_err(report_error)?;
    log.info(Fields::new().with("body", &req), "Report ran.");

    json(StatusCode::OK, &RunResponse { result })
}

fn report_error(error: ReportError) -> ServiceError {
    match error {
        ReportError::Forbidden { .. } => ServiceError::Validation(format!("Invalid request: {error}.")),
        error => ServiceError::internal(error),
    }
}

fn check_content_type(headers: &HeaderMap) -> Result<(), ServiceError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type == Some(JSON_CONTENT_TYPE) {
        return Ok(());
    }
    Err(ServiceError::UnsupportedMediaType(format!(
        "request content-type must be {JSON_CONTENT_TYPE}"
    )))
}

async fn read_body(body: RequestBody, limit: usize) -> Result<Bytes, ServiceError> {
    // Boxed with a concrete type to sidestep a rustc higher-ranked `Send`
    // inference bug ("implementation of `From` is not general enough").
    let collect: Pin<Box<dyn Future<Output = Result<Collected<Bytes>, BoxError>> + Send>> =
        Box::pin(Limited::new(body, limit).collect());
    match collect.await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ServiceError::PayloadTooLarge { limit })
        }
        Err(e) => Err(ServiceError::Internal(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::Method;
    use http_body_util::Full;
    use mockall::predicate::eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::log::{LogRecord, MemorySink};
    use crate::report::MockReportRunner;
    use crate::router::Router;
    use crate::routes;

    fn router(runner: MockReportRunner, sink: &Arc<MemorySink>) -> Router {
        let state = AppState::new(Arc::new(runner), 64);
        Router::new(routes::table(state).unwrap(), Log::new(sink.clone()))
    }

    fn idle_runner() -> MockReportRunner {
        let mut runner = MockReportRunner::new();
        runner.expect_run().never();
        runner
    }

    async fn post(router: Router, content_type: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from(body.to_owned())))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn error_record(records: &[LogRecord]) -> &LogRecord {
        assert_eq!(records.len(), 3, "{records:?}");
        &records[1]
    }

    #[tokio::test]
    async fn rejects_non_json_content_type() {
        let sink = Arc::new(MemorySink::new());
        let (status, body) = post(router(idle_runner(), &sink), "text/plain", "").await;

        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body, json!({"error": "request content-type must be application/json"}));
        let record = error_record(&sink.records()).clone();
        assert_eq!(record.msg, "Unsupported media type.");
        assert_eq!(
            record.get("error").unwrap()["message"],
            "request content-type must be application/json"
        );
    }

    #[tokio::test]
    async fn rejects_non_object_body() {
        let sink = Arc::new(MemorySink::new());
        let (status, body) = post(router(idle_runner(), &sink), JSON_CONTENT_TYPE, r#"["test"]"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("body must be an object"));
        assert_eq!(error_record(&sink.records()).msg, "Invalid request.");
    }

    #[tokio::test]
    async fn rejects_missing_report() {
        let sink = Arc::new(MemorySink::new());
        let (status, body) = post(router(idle_runner(), &sink), JSON_CONTENT_TYPE, "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("report field must be defined"));
    }

    #[tokio::test]
    async fn rejects_non_string_report() {
        let sink = Arc::new(MemorySink::new());
        let (status, body) =
            post(router(idle_runner(), &sink), JSON_CONTENT_TYPE, r#"{"report": {}}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("report field must be a string"));
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let sink = Arc::new(MemorySink::new());
        let big = format!(r#"{{"report": "{}"}}"#, "x".repeat(100));
        let (status, body) = post(router(idle_runner(), &sink), JSON_CONTENT_TYPE, &big).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body, json!({"error": "request body exceeds 64 bytes"}));
    }

    #[tokio::test]
    async fn runs_report_and_returns_result() {
        let mut runner = MockReportRunner::new();
        runner
            .expect_run()
            .with(eq("/reports/echo"), eq(Some(json!("Test"))))
            .times(1)
            .returning(|_, parameters| Ok(parameters.unwrap_or(Value::Null)));
        let sink = Arc::new(MemorySink::new());

        let (status, body) = post(
            router(runner, &sink),
            JSON_CONTENT_TYPE,
            r#"{"report": "/reports/echo", "parameters": "Test"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": "Test"}));

        let records = sink.records();
        let msgs: Vec<_> = records.iter().map(|r| r.msg.as_str()).collect();
        assert_eq!(msgs, ["Request received.", "Running report ...", "Report ran.", "Response sent."]);
        for record in &records[1..3] {
            assert_eq!(record.get("body").unwrap()["report"], "/reports/echo");
            assert!(record.fields.contains_key("request"));
        }
    }

    #[tokio::test]
    async fn report_failure_is_500() {
        let mut runner = MockReportRunner::new();
        runner.expect_run().returning(|report, _| {
            Err(ReportError::Failed {
                report: report.to_owned(),
                status: "exit status: 1".into(),
                stderr: "boom".into(),
            })
        });
        let sink = Arc::new(MemorySink::new());

        let (status, body) =
            post(router(runner, &sink), JSON_CONTENT_TYPE, r#"{"report": "/r"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "report /r failed (exit status: 1): boom"}));
        let msgs: Vec<_> = sink.records().into_iter().map(|r| r.msg).collect();
        assert_eq!(
            msgs,
            ["Request received.", "Running report ...", "Internal server error.", "Response sent."]
        );
    }

    #[tokio::test]
    async fn report_outside_reports_dir_is_400() {
        let mut runner = MockReportRunner::new();
        runner.expect_run().returning(|report, _| {
            Err(ReportError::Forbidden {
                report: report.to_owned(),
            })
        });
        let sink = Arc::new(MemorySink::new());

        let (status, body) =
            post(router(runner, &sink), JSON_CONTENT_TYPE, r#"{"report": "/bin/sh"}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"error": "Invalid request: report /bin/sh is outside the reports directory."})
        );
    }

    #[tokio::test]
    async fn other_paths_are_not_routed() {
        let sink = Arc::new(MemorySink::new());
        let request = Request::get("/").body(Full::<Bytes>::default()).unwrap();
        let response = router(idle_runner(), &sink).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[http::header::ALLOW], "POST");
    }
}
