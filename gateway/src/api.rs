//! HTTP surface for the SDK API.
//!
//! JSON over three POST routes plus a health probe. The API key travels in
//! the `authorization` header; per-request cancellation is derived from the
//! server's shutdown signal so in-flight requests fail fast on drain.

use crate::errors::GatewayError;
use crate::metrics_defs::REQUEST_DURATION;
use crate::service::{
    GatewayService, GetEvaluationRequest, GetEvaluationsRequest, RegisterEventsRequest,
    RequestContext,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::http::make_error_response;
use shared::shutdown::ShutdownHandle;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ApiService {
    service: Arc<GatewayService>,
    shutdown: ShutdownHandle,
    request_timeout: Duration,
}

impl ApiService {
    pub fn new(
        service: Arc<GatewayService>,
        shutdown: ShutdownHandle,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service,
            shutdown,
            request_timeout,
        }
    }
}

impl<B> Service<Request<B>> for ApiService
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let service = self.service.clone();
        let shutdown = self.shutdown.clone();
        let request_timeout = self.request_timeout;

        Box::pin(async move {
            let started = Instant::now();
            let (parts, body) = req.into_parts();
            let handler = handler_name(&parts.method, parts.uri.path());

            let api_key = parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let ctx = RequestContext::new(api_key, shutdown);

            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(make_error_response(StatusCode::BAD_REQUEST).map(Full::new));
                }
            };

            let dispatch = async {
                match (&parts.method, parts.uri.path()) {
                    (&Method::POST, "/v1/gateway/evaluations") => {
                        match parse_body::<GetEvaluationsRequest>(&body_bytes) {
                            Ok(request) => reply(service.get_evaluations(&ctx, request).await),
                            Err(response) => response,
                        }
                    }
                    (&Method::POST, "/v1/gateway/evaluation") => {
                        match parse_body::<GetEvaluationRequest>(&body_bytes) {
                            Ok(request) => reply(service.get_evaluation(&ctx, request).await),
                            Err(response) => response,
                        }
                    }
                    (&Method::POST, "/v1/gateway/events") => {
                        match parse_body::<RegisterEventsRequest>(&body_bytes) {
                            Ok(request) => reply(service.register_events(&ctx, request).await),
                            Err(response) => response,
                        }
                    }
                    (&Method::GET, "/health") => {
                        Response::new(Full::new(Bytes::from_static(b"ok\n")))
                    }
                    _ => make_error_response(StatusCode::NOT_FOUND).map(Full::new),
                }
            };
            // The deadline covers the whole downstream fan-out; in-flight
            // origin calls are dropped with the dispatch future.
            let response = match tokio::time::timeout(request_timeout, dispatch).await {
                Ok(response) => response,
                Err(_) => make_error_response(StatusCode::SERVICE_UNAVAILABLE).map(Full::new),
            };

            metrics::histogram!(
                REQUEST_DURATION.name,
                "handler" => handler,
                "status" => response.status().as_u16().to_string(),
            )
            .record(started.elapsed().as_secs_f64());

            Ok(response)
        })
    }
}

fn handler_name(method: &Method, path: &str) -> &'static str {
    match (method, path) {
        (&Method::POST, "/v1/gateway/evaluations") => "get_evaluations",
        (&Method::POST, "/v1/gateway/evaluation") => "get_evaluation",
        (&Method::POST, "/v1/gateway/events") => "register_events",
        (&Method::GET, "/health") => "health",
        _ => "unknown",
    }
}

fn parse_body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(bytes)
        .map_err(|_| make_error_response(StatusCode::BAD_REQUEST).map(Full::new))
}

fn reply<T: Serialize>(result: Result<T, GatewayError>) -> Response<Full<Bytes>> {
    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => json_response(
            status_for(&err),
            &serde_json::json!({"error": err.to_string()}),
        ),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => return make_error_response(StatusCode::INTERNAL_SERVER_ERROR).map(Full::new),
    };
    let mut response = Response::new(Full::new(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", "application/json".parse().expect("static header value"));
    response
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        // Client closed request, in the nginx convention.
        GatewayError::ContextCanceled => StatusCode::from_u16(499).expect("499 is a valid status"),
        GatewayError::MissingApiKey | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
        GatewayError::BadRole | GatewayError::DisabledApiKey => StatusCode::FORBIDDEN,
        GatewayError::TagRequired
        | GatewayError::UserRequired
        | GatewayError::UserIdRequired
        | GatewayError::FeatureIdRequired
        | GatewayError::MissingEvents
        | GatewayError::MissingEventId => StatusCode::BAD_REQUEST,
        GatewayError::FeatureNotFound => StatusCode::NOT_FOUND,
        GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{sdk_api_key, ServiceBuilder};
    use feature::model::{Feature, Strategy, Variation};
    use shared::shutdown::ShutdownSignal;

    fn api(builder: ServiceBuilder) -> (ApiService, Arc<GatewayService>) {
        let service = Arc::new(builder.build_service());
        (
            ApiService::new(
                service.clone(),
                ShutdownHandle::never(),
                Duration::from_secs(15),
            ),
            service,
        )
    }

    fn request(method: Method, path: &str, api_key: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(key) = api_key {
            builder = builder.header(AUTHORIZATION, key);
        }
        builder
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_feature() -> Feature {
        Feature {
            id: "feature-a".into(),
            variations: vec![Variation {
                id: "variation-a".into(),
                value: "true".into(),
            }],
            default_strategy: Some(Strategy::Fixed {
                variation: "variation-a".into(),
            }),
            tags: vec!["ios".into()],
            enabled: true,
            version: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn evaluations_round_trip() {
        let (api, _service) = api(ServiceBuilder::new()
            .api_key(sdk_api_key("ns0"))
            .features(vec![test_feature()]));

        let response = api
            .call(request(
                Method::POST,
                "/v1/gateway/evaluations",
                Some("test-key"),
                r#"{"tag":"ios","user":{"id":"user-1"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["state"], "FULL");
        assert_eq!(json["evaluations"]["evaluations"][0]["variation_id"], "variation-a");
        assert!(!json["user_evaluations_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let (api, _service) = api(ServiceBuilder::new());
        let response = api
            .call(request(
                Method::POST,
                "/v1/gateway/evaluations",
                None,
                r#"{"tag":"ios","user":{"id":"user-1"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Missing API key");
    }

    #[tokio::test]
    async fn unknown_feature_is_not_found() {
        let (api, _service) = api(ServiceBuilder::new()
            .api_key(sdk_api_key("ns0"))
            .features(vec![test_feature()]));

        let response = api
            .call(request(
                Method::POST,
                "/v1/gateway/evaluation",
                Some("test-key"),
                r#"{"tag":"ios","user":{"id":"user-1"},"feature_id":"missing"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_events_reports_per_event_errors_with_status_ok() {
        let (api, _service) = api(ServiceBuilder::new().api_key(sdk_api_key("ns0")));

        let response = api
            .call(request(
                Method::POST,
                "/v1/gateway/events",
                Some("test-key"),
                r#"{"events":[{"id":"uuid-0","event":{"type":"experiment"}}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["errors"]["uuid-0"]["retriable"], false);
        assert_eq!(json["errors"]["uuid-0"]["message"], "Invalid message type");
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let (api, _service) = api(ServiceBuilder::new().api_key(sdk_api_key("ns0")));
        let response = api
            .call(request(
                Method::POST,
                "/v1/gateway/evaluations",
                Some("test-key"),
                "{not json",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let (api, _service) = api(ServiceBuilder::new());

        let response = api
            .call(request(Method::GET, "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = api
            .call(request(Method::GET, "/nope", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn drained_server_cancels_requests() {
        let signal = ShutdownSignal::new();
        let service = Arc::new(ServiceBuilder::new().build_service());
        let api = ApiService::new(service, signal.handle(), Duration::from_secs(15));
        signal.shutdown();

        let response = api
            .call(request(
                Method::POST,
                "/v1/gateway/evaluations",
                Some("test-key"),
                r#"{"tag":"ios","user":{"id":"user-1"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 499);
    }
}
