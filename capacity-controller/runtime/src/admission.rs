use crate::{
    decision::{self, AdmissionRequest, Decision, Engine, Skip},
    index::Readiness,
    k8s,
    metrics::{AdmissionMetrics, Failure},
    patch,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::DynamicObject;
use std::{convert::Infallible, sync::Arc};
use tokio::time;
use tracing::{debug, info_span, trace, warn, Instrument};

/// Serves mutating admission reviews for pods.
#[derive(Clone, Debug)]
pub struct Admission {
    engine: Engine,
    readiness: Readiness,
    path: Arc<str>,
    deadline: time::Duration,
    metrics: AdmissionMetrics,
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<B> tower::Service<Request<B>> for Admission
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display + Send,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri(), headers = ?req.headers());
        if req.uri().path() != &*self.path {
            return Box::pin(future::ok(status(http::StatusCode::NOT_FOUND)));
        }
        if req.method() != http::Method::POST {
            return Box::pin(future::ok(status(http::StatusCode::METHOD_NOT_ALLOWED)));
        }
        if !is_json(req.headers()) {
            debug!(content_type = ?req.headers().get(http::header::CONTENT_TYPE), "Unsupported content type");
            return Box::pin(future::ok(status(http::StatusCode::BAD_REQUEST)));
        }

        let admission = self.clone();
        Box::pin(async move {
            let start = time::Instant::now();
            let bytes = match req.into_body().collect().await {
                Ok(body) => body.to_bytes(),
                Err(error) => {
                    warn!(%error, "Failed to read request body");
                    admission.metrics.failure(Failure::Invalid, start);
                    return Ok(status(http::StatusCode::BAD_REQUEST));
                }
            };
            Ok(admission.review(&bytes, start).await)
        })
    }
}

impl Admission {
    pub fn new(
        engine: Engine,
        readiness: Readiness,
        path: impl Into<Arc<str>>,
        deadline: time::Duration,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            engine,
            readiness,
            path: path.into(),
            deadline,
            metrics,
        }
    }

    async fn review(self, bytes: &[u8], start: time::Instant) -> Response<Body> {
        let review: Review = match serde_json::from_slice(bytes) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse admission review");
                self.metrics.failure(Failure::Invalid, start);
                return status(http::StatusCode::BAD_REQUEST);
            }
        };
        trace!(?review);

        let req: AdmissionRequest = match review.try_into() {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "Invalid admission review");
                self.metrics.failure(Failure::Invalid, start);
                return status(http::StatusCode::BAD_REQUEST);
            }
        };

        let span = info_span!(
            "admit",
            uid = %req.uid,
            ns = req.namespace.as_deref().unwrap_or_default(),
            operation = ?req.operation,
        );
        self.admit(req, start).instrument(span).await
    }

    async fn admit(self, req: AdmissionRequest, start: time::Instant) -> Response<Body> {
        let deadline = start + self.deadline;

        let pod = match decision::decode(&req) {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                let encoded = encode(AdmissionResponse::from(&req).into_review());
                return self.respond(encoded, &Decision::Skip(Skip::NotPodCreate), start);
            }
            Err(error) => {
                warn!(%error, "Failed to decode pod");
                self.metrics.failure(Failure::Decode, start);
                return status(http::StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        if !self.readiness.is_ready() {
            debug!("Waiting for caches to sync");
            if !matches!(
                time::timeout_at(deadline, self.readiness.ready()).await,
                Ok(true)
            ) {
                warn!("Caches not synced");
                self.metrics.failure(Failure::NotReady, start);
                return status(http::StatusCode::SERVICE_UNAVAILABLE);
            }
        }

        let decision = match time::timeout_at(
            deadline,
            self.engine.decide(&req.uid, &pod, req.dry_run),
        )
        .await
        {
            Ok(decision) => decision,
            Err(_) => {
                warn!(deadline = ?self.deadline, "Admission deadline exceeded");
                self.metrics.failure(Failure::Deadline, start);
                return status(http::StatusCode::SERVICE_UNAVAILABLE);
            }
        };

        let rsp = AdmissionResponse::from(&req);
        let encoded = match decision {
            Decision::Assign(pool) => patch::build(pool, pod.spec.as_ref())
                .and_then(|patch| {
                    rsp.with_patch(patch)
                        .map_err(<serde_json::Error as serde::ser::Error>::custom)
                })
                .and_then(|rsp| encode(rsp.into_review())),
            Decision::Pinned(_) | Decision::Skip(_) => encode(rsp.into_review()),
        };
        debug!(?decision);
        self.respond(encoded, &decision, start)
    }

    fn respond(
        &self,
        encoded: serde_json::Result<Vec<u8>>,
        decision: &Decision,
        start: time::Instant,
    ) -> Response<Body> {
        match encoded {
            Ok(bytes) => {
                self.metrics.decision(decision, start);
                Response::builder()
                    .status(http::StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))
                    .expect("admission review response must be valid")
            }
            Err(error) => {
                warn!(%error, ?decision, "Failed to encode admission response");
                self.metrics.failure(Failure::Encode, start);
                status(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Serializes a review, carrying any patch as a base64 string.
fn encode(review: Review) -> serde_json::Result<Vec<u8>> {
    let mut review = serde_json::to_value(review)?;
    if let Some(patch) = review.pointer_mut("/response/patch") {
        if patch.is_array() {
            let bytes = serde_json::from_value::<Vec<u8>>(patch.take())?;
            *patch = serde_json::to_value(k8s::ByteString(bytes))?;
        }
    }
    serde_json::to_vec(&review)
}

fn is_json(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"))
}

fn status(code: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::default())
        .expect("status response must be valid")
}
