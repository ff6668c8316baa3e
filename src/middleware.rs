//! Axum middleware layer for request analytics.
//!
//! Counts every request as an active session, records its response time,
//! counts 5xx answers as errors, and wraps the response body so the session
//! stays active until streaming completes.

use crate::analytics::Analytics;
use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::Frame;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::trace;

/// Layer that feeds [`Analytics`] from the request stream.
#[derive(Clone)]
pub struct RequestTrackingLayer {
    analytics: Arc<Analytics>,
}

impl RequestTrackingLayer {
    pub fn new(analytics: Arc<Analytics>) -> Self {
        Self { analytics }
    }
}

impl<S> Layer<S> for RequestTrackingLayer {
    type Service = RequestTrackingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestTrackingService {
            analytics: self.analytics.clone(),
            inner,
        }
    }
}

#[derive(Clone)]
pub struct RequestTrackingService<S> {
    analytics: Arc<Analytics>,
    inner: S,
}

impl<S> Service<Request<Body>> for RequestTrackingService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let analytics = self.analytics.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            let session = Session::open(analytics.clone());
            let started = Instant::now();

            let response = inner.call(req).await?;

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            analytics.record_response_time(elapsed_ms);
            if response.status().is_server_error() {
                analytics.inc_error();
            }
            trace!(path = %path, status = %response.status(), elapsed_ms, "Request tracked");

            let (parts, body) = response.into_parts();
            let tracked = TrackedBody {
                inner: body,
                _session: session,
            };
            Ok(Response::from_parts(parts, Body::new(tracked)))
        })
    }
}

/// An active session; closed on drop, so aborted requests are balanced too.
struct Session {
    analytics: Arc<Analytics>,
}

impl Session {
    fn open(analytics: Arc<Analytics>) -> Self {
        analytics.inc_request();
        metrics::gauge!("llama_supervisor_active_sessions").set(analytics.active_sessions() as f64);
        Self { analytics }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.analytics.dec_request();
        metrics::gauge!("llama_supervisor_active_sessions")
            .set(self.analytics.active_sessions() as f64);
    }
}

/// Response body that holds a [`Session`] until fully consumed or dropped.
struct TrackedBody {
    inner: Body,
    _session: Session,
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app(analytics: Arc<Analytics>) -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/fail",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .layer(RequestTrackingLayer::new(analytics))
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_session_open_until_body_dropped() {
        let analytics = Arc::new(Analytics::new("/nonexistent/logs"));

        let response = app(analytics.clone())
            .oneshot(get_request("/ok"))
            .await
            .unwrap();
        assert_eq!(analytics.active_sessions(), 1);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
        assert_eq!(analytics.active_sessions(), 0);
        assert_eq!(analytics.response_times().len(), 1);
    }

    #[tokio::test]
    async fn test_only_server_errors_count() {
        let analytics = Arc::new(Analytics::new("/nonexistent/logs"));

        for path in ["/ok", "/fail", "/missing"] {
            let response = app(analytics.clone())
                .oneshot(get_request(path))
                .await
                .unwrap();
            drop(response);
        }

        let snapshot = analytics.snapshot().await;
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.active_sessions, 0);
    }
}
