use std::collections::BTreeMap;
use std::sync::Arc;
use std::task;

use anyhow::{anyhow, Context, Result};
use futures::future;
use hyper::{body::Buf, header, http, Body, Method, Request, Response};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::core::{admission, DynamicObject};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::annotation::UserGroupAnnotationHandler;
use crate::config::AdmissionConfig;
use crate::core::{labels, patch};
use crate::metrics::{Endpoint, Metrics};
use crate::validation::ConfValidator;

const MUTATE_PATH: &str = "/mutate";
const VALIDATE_CONF_PATH: &str = "/validate-conf";
const HEALTH_PATH: &str = "/health";

/// Response identifier used when no request id could be recovered from the
/// body.
const INVALID_BODY_UID: &str = "yunikorn-invalid-body";

type Review = admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = admission::AdmissionResponse;

/// The webhook server: routes review requests to the mutation and
/// configuration-validation engines and wraps their verdicts back into review
/// envelopes.
#[derive(Clone)]
pub struct Service {
    config: Arc<AdmissionConfig>,
    annotations: UserGroupAnnotationHandler,
    validator: ConfValidator,
    metrics: Metrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

impl hyper::service::Service<Request<Body>> for Service {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let service = self.clone();
        Box::pin(service.serve(req))
    }
}

impl Service {
    pub fn new(config: Arc<AdmissionConfig>, metrics: Metrics) -> Self {
        Self {
            annotations: UserGroupAnnotationHandler::new(config.clone()),
            validator: ConfValidator::new(config.clone()),
            config,
            metrics,
        }
    }

    async fn serve(self, req: Request<Body>) -> Result<Response<Body>, Error> {
        if req.method() == Method::GET && req.uri().path() == HEALTH_PATH {
            return Ok(Response::builder()
                .status(http::StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("OK\r\n"))
                .expect("health response must be valid"));
        }

        let path = req.uri().path().to_string();
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = hyper::body::aggregate(req.into_body()).await?;
        if !body.has_remaining() {
            debug!("rejecting request with an empty body");
            return Ok(plain_response(
                http::StatusCode::BAD_REQUEST,
                "empty or invalid body",
            ));
        }

        if content_type != "application/json" {
            debug!(%content_type, "rejecting request with an unsupported content type");
            return Ok(plain_response(
                http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "invalid Content-Type, expect `application/json`",
            ));
        }

        let endpoint = match path.as_str() {
            MUTATE_PATH => Endpoint::Mutate,
            VALIDATE_CONF_PATH => Endpoint::ValidateConf,
            _ => {
                debug!(%path, "rejecting request for an unsupported path");
                return Ok(plain_response(
                    http::StatusCode::NOT_FOUND,
                    "request is neither mutation nor validation",
                ));
            }
        };

        let rsp = match parse_review(body) {
            Ok(req) => match endpoint {
                Endpoint::Mutate => self.mutate(&req),
                Endpoint::ValidateConf => self.validate_conf(&req).await,
            },
            Err(error) => {
                warn!(%error, "request body decode failed");
                let mut rsp = AdmissionResponse::invalid("body decode failed");
                rsp.uid = INVALID_BODY_UID.to_string();
                rsp
            }
        };

        self.metrics.observe(endpoint, rsp.allowed);
        json_response(rsp.into_review())
    }

    /// Decides how a workload object is mutated before acceptance.
    fn mutate(&self, req: &AdmissionRequest) -> AdmissionResponse {
        if req.kind.kind == "Pod" {
            return self.mutate_pod(req);
        }
        self.mutate_workload(req)
    }

    fn mutate_pod(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        let namespace = request_namespace(req);

        info!(
            %namespace,
            uid = %req.uid,
            operation = ?req.operation,
            user = %username(req),
            "pod admission review"
        );

        let pod: Pod = match parse_object(req) {
            Ok(pod) => pod,
            Err(error) => {
                warn!(%error, "failed to decode pod");
                return rsp.deny(error.to_string());
            }
        };
        let pod_labels: BTreeMap<String, String> = pod.metadata.labels.clone().unwrap_or_default();
        let pod_annotations = pod.metadata.annotations.clone().unwrap_or_default();

        if let Some(failure) = self.check_user_info(req, || {
            pod_annotations.get(labels::USER_INFO_ANNOTATION).cloned()
        }) {
            return failure;
        }

        // Never touch the scheduler's own pods.
        if pod_labels.get(labels::APP_LABEL).map(String::as_str) == Some(labels::SCHEDULER_NAME) {
            info!(pod = %pod_name(&pod), "ignoring scheduler infrastructure pod");
            return rsp;
        }

        if !self.config.filter.should_mutate(&namespace) {
            info!(%namespace, "bypassing namespace");
            return rsp;
        }

        let should_label = self.config.filter.should_label(&namespace);
        if !should_label {
            info!(
                pod = %pod_name(&pod),
                %namespace,
                "skipping pod label update, namespace is set to no-label"
            );
        }

        let patch = patch::pod_mutation(&namespace, &pod_labels, should_label);
        debug!(pod = %pod_name(&pod), ?patch, "generated patch");

        match rsp.with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, "failed to serialize patch");
                AdmissionResponse::from(req).deny(format!("failed to serialize patch: {error}"))
            }
        }
    }

    fn mutate_workload(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        let kind = &req.kind.kind;

        let annotations = match self
            .annotations
            .annotations_from_request_kind(kind, req.object.as_ref())
        {
            // Kinds this controller does not understand pass untouched.
            None => {
                debug!(%kind, "passing through unsupported workload kind");
                return rsp;
            }
            Some(Err(error)) => {
                warn!(%error, %kind, "failed to extract workload annotations");
                return rsp.deny(error.to_string());
            }
            Some(Ok(annotations)) => annotations,
        };

        if let Some(failure) = self.check_user_info(req, || {
            annotations.get(labels::USER_INFO_ANNOTATION).cloned()
        }) {
            return failure;
        }

        rsp
    }

    /// Authorizes and validates a caller-supplied identity annotation. `None`
    /// means the review continues; a verdict is always a denial.
    fn check_user_info(
        &self,
        req: &AdmissionRequest,
        get_annotation: impl FnOnce() -> Option<String>,
    ) -> Option<AdmissionResponse> {
        let annotation = get_annotation()?;
        if self.config.bypass_auth {
            return None;
        }

        let user = username(req);
        let groups = req.user_info.groups.clone().unwrap_or_default();
        if !self.annotations.is_annotation_allowed(&user, &groups) {
            warn!(%user, ?groups, "submitter is not allowed to set the user.info annotation");
            return Some(AdmissionResponse::from(req).deny(format!(
                "user {} with groups [{}] is not allowed to set user annotation",
                user,
                groups.join(",")
            )));
        }

        if let Err(error) = self.annotations.is_annotation_valid(&annotation) {
            warn!(%error, "invalid user.info annotation");
            return Some(AdmissionResponse::from(req).deny(error.to_string()));
        }

        None
    }

    /// Decides whether a scheduler configuration change is accepted.
    async fn validate_conf(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        let namespace = request_namespace(req);

        if req.kind.kind != "ConfigMap" {
            warn!(kind = %req.kind.kind, "configuration review for an unexpected kind");
            return rsp;
        }

        let config_map: ConfigMap = match parse_object(req) {
            Ok(config_map) => config_map,
            Err(error) => {
                warn!(%error, "failed to decode ConfigMap");
                return rsp.deny(error.to_string());
            }
        };

        match self.validator.validate_config_map(&namespace, config_map).await {
            Ok(()) => rsp,
            Err(error) => {
                warn!(%error, "rejecting configuration change");
                rsp.deny(error.to_string())
            }
        }
    }
}

fn parse_review(body: impl Buf) -> Result<AdmissionRequest> {
    let review: Review =
        serde_json::from_reader(body.reader()).context("body decode failed")?;
    review
        .try_into()
        .map_err(|error| anyhow!("review contains no request: {error}"))
}

fn parse_object<T: serde::de::DeserializeOwned>(req: &AdmissionRequest) -> Result<T> {
    let object = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request is missing the object under review"))?;
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(Into::into)
}

fn request_namespace(req: &AdmissionRequest) -> String {
    req.namespace
        .clone()
        .filter(|namespace| !namespace.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

fn username(req: &AdmissionRequest) -> String {
    req.user_info.username.clone().unwrap_or_default()
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default()
}

fn json_response(review: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&review)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn plain_response(status: http::StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(message))
        .expect("error response must be valid")
}
