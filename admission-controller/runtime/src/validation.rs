use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use hyper::{client::HttpConnector, header, Body, Client, Method, Request, Uri};
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{self, AdmissionConfig, ConfigMapSlot};

/// Verdict returned by the scheduler's validation endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ValidateConfResponse {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub reason: String,
}

/// Validates scheduler configuration changes against the scheduler itself.
#[derive(Clone, Debug)]
pub struct ConfValidator {
    config: Arc<AdmissionConfig>,
    client: Client<HttpConnector>,
}

impl ConfValidator {
    pub fn new(config: Arc<AdmissionConfig>) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    /// Validates a new or updated ConfigMap. `Ok(())` admits the change; an
    /// error carries the reason the scheduler rejected it.
    ///
    /// Only an explicit rejection from the scheduler fails a change. An
    /// unreachable scheduler, an unexpected status, or an unreadable response
    /// all admit the change: configuration acceptance must not depend on
    /// scheduler liveness.
    pub async fn validate_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<()> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        if namespace != self.config.namespace {
            debug!(%namespace, %name, "ConfigMap does not belong to the scheduler");
            return Ok(());
        }
        let slot = match ConfigMapSlot::for_name(&name) {
            Some(slot) => slot,
            None => {
                debug!(%namespace, %name, "ConfigMap does not belong to the scheduler");
                return Ok(());
            }
        };

        let maps = self.config.store_config_map(slot, config_map);
        let flat = config::flatten_config_maps(&maps);
        let conf_key = format!("{}.yaml", config::policy_group(&flat));
        let content = match flat.get(&conf_key) {
            Some(content) => content.clone(),
            None => {
                info!(entry = %conf_key, "configuration is missing the policy group entry, validating empty content");
                String::new()
            }
        };

        let checksum = hex_digest(&content);
        info!(%checksum, "validating scheduler configuration");
        debug!(%content, "configuration content");

        let response = match self.post_to_scheduler(content).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "scheduler did not answer, assuming the configuration is valid");
                return Ok(());
            }
        };

        if !response.allowed {
            bail!("{}", response.reason);
        }

        info!("scheduler accepted the configuration");
        Ok(())
    }

    async fn post_to_scheduler(&self, content: String) -> Result<ValidateConfResponse> {
        let uri: Uri = format!(
            "http://{}/ws/v1/validate-conf",
            self.config.scheduler_service_address
        )
        .parse()?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(content))?;

        let response = tokio::time::timeout(
            self.config.scheduler_timeout,
            self.client.request(request),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "validation timed out after {:?}",
                self.config.scheduler_timeout
            )
        })??;

        let status = response.status();
        if !status.is_success() {
            bail!("scheduler responded with unexpected status {status}");
        }

        let body = hyper::body::to_bytes(response.into_body()).await?;
        serde_json::from_slice(&body)
            .map_err(|error| anyhow!("unable to parse scheduler response: {error}"))
    }
}

fn hex_digest(content: &str) -> String {
    Sha256::digest(content.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server, StatusCode};
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn validator(scheduler_service_address: String) -> ConfValidator {
        ConfValidator::new(Arc::new(AdmissionConfig {
            namespace: "yunikorn".to_string(),
            scheduler_service_address,
            scheduler_timeout: Duration::from_millis(500),
            ..Default::default()
        }))
    }

    fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Serves a fixed response and records the last request body.
    async fn spawn_scheduler(
        status: StatusCode,
        body: &'static str,
    ) -> (SocketAddr, Arc<Mutex<Option<String>>>) {
        let seen = Arc::new(Mutex::new(None));
        let make = {
            let seen = seen.clone();
            make_service_fn(move |_| {
                let seen = seen.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |request| {
                        let seen = seen.clone();
                        async move {
                            let bytes = hyper::body::to_bytes(request.into_body()).await.unwrap();
                            *seen.lock() = Some(String::from_utf8_lossy(&bytes).into_owned());
                            Response::builder()
                                .status(status)
                                .header(header::CONTENT_TYPE, "application/json")
                                .body(Body::from(body))
                        }
                    }))
                }
            })
        };
        let bind: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = Server::bind(&bind).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        (addr, seen)
    }

    #[tokio::test]
    async fn foreign_namespace_passes_without_a_remote_call() {
        let validator = validator("127.0.0.1:1".to_string());
        let result = validator
            .validate_config_map("elsewhere", config_map("yunikorn-configs", &[]))
            .await;
        assert!(result.is_ok());
        assert!(validator.config.config_maps.lock()[1].is_none());
    }

    #[tokio::test]
    async fn foreign_name_passes_without_a_remote_call() {
        let validator = validator("127.0.0.1:1".to_string());
        let result = validator
            .validate_config_map("yunikorn", config_map("some-other-map", &[]))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn accepted_configuration_passes() {
        let (addr, seen) = spawn_scheduler(StatusCode::OK, r#"{"allowed": true, "reason": ""}"#).await;
        let validator = validator(addr.to_string());
        let result = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "partitions: []")]),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(seen.lock().as_deref(), Some("partitions: []"));
    }

    #[tokio::test]
    async fn rejected_configuration_surfaces_the_scheduler_reason() {
        let (addr, _) = spawn_scheduler(
            StatusCode::OK,
            r#"{"allowed": false, "reason": "undefined queue root.missing"}"#,
        )
        .await;
        let validator = validator(addr.to_string());
        let error = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "partitions: []")]),
            )
            .await
            .expect_err("rejection must surface");
        assert!(error.to_string().contains("undefined queue root.missing"));
    }

    #[tokio::test]
    async fn unexpected_status_fails_open() {
        let (addr, _) = spawn_scheduler(StatusCode::SERVICE_UNAVAILABLE, "busy").await;
        let validator = validator(addr.to_string());
        let result = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "partitions: []")]),
            )
            .await;
        assert!(result.is_ok(), "an unavailable scheduler must not block changes");
    }

    #[tokio::test]
    async fn unparseable_response_fails_open() {
        let (addr, _) = spawn_scheduler(StatusCode::OK, "<!doctype html>").await;
        let validator = validator(addr.to_string());
        let result = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "partitions: []")]),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_scheduler_fails_open() {
        let validator = validator("127.0.0.1:1".to_string());
        let result = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "partitions: []")]),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn silent_scheduler_times_out_and_fails_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept connections but never answer them.
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                std::mem::forget(socket);
            }
        });

        let validator = validator(addr.to_string());
        let result = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "partitions: []")]),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_policy_group_entry_validates_empty_content() {
        let (addr, seen) = spawn_scheduler(StatusCode::OK, r#"{"allowed": true, "reason": ""}"#).await;
        let validator = validator(addr.to_string());
        let result = validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("unrelated.yaml", "x: 1")]),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(seen.lock().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn override_content_wins_over_defaults() {
        let (addr, seen) = spawn_scheduler(StatusCode::OK, r#"{"allowed": true, "reason": ""}"#).await;
        let validator = validator(addr.to_string());
        validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-defaults", &[("queues.yaml", "default-content")]),
            )
            .await
            .unwrap();
        validator
            .validate_config_map(
                "yunikorn",
                config_map("yunikorn-configs", &[("queues.yaml", "override-content")]),
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().as_deref(), Some("override-content"));
    }

    #[test]
    fn checksum_is_uppercase_hex() {
        let digest = hex_digest("");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        );
    }
}
