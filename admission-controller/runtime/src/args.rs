use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use prometheus_client::registry::Registry;
use tracing::{info, warn};

use crate::admission;
use crate::config::{self, AdmissionConfig, ConfigMapSlot};
use crate::core::filter::{parse_patterns, NamespaceFilter};
use crate::metrics::Metrics;

#[derive(Debug, Parser)]
#[clap(name = "admission-controller", about = "YuniKorn admission controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "yunikorn=info,warn",
        env = "YUNIKORN_ADMISSION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace the scheduler and its configuration live in.
    #[clap(long, default_value = "yunikorn", env = "ADMISSION_CONTROLLER_NAMESPACE")]
    namespace: String,

    /// host:port of the scheduler's REST service.
    #[clap(
        long,
        default_value = "yunikorn-service:9080",
        env = "ADMISSION_CONTROLLER_SCHEDULER_SERVICE_ADDRESS"
    )]
    scheduler_service_address: String,

    /// Bound on the scheduler validation call; expiry admits the change.
    #[clap(long, default_value = "10000")]
    scheduler_timeout_ms: u64,

    /// Skip authorization checks on the user.info annotation.
    #[clap(long, env = "ADMISSION_CONTROLLER_BYPASS_AUTH")]
    bypass_auth: bool,

    /// Namespaces eligible for mutation (comma-separated regular expressions;
    /// empty matches every namespace).
    #[clap(long, default_value = "", env = "ADMISSION_CONTROLLER_PROCESS_NAMESPACES")]
    process_namespaces: String,

    /// Namespaces that are never mutated.
    #[clap(
        long,
        default_value = "^kube-system$",
        env = "ADMISSION_CONTROLLER_BYPASS_NAMESPACES"
    )]
    bypass_namespaces: String,

    /// Namespaces whose pods receive scheduling labels (comma-separated
    /// regular expressions; empty matches every namespace).
    #[clap(long, default_value = "", env = "ADMISSION_CONTROLLER_LABEL_NAMESPACES")]
    label_namespaces: String,

    /// Namespaces whose pods never receive scheduling labels.
    #[clap(long, default_value = "", env = "ADMISSION_CONTROLLER_NO_LABEL_NAMESPACES")]
    no_label_namespaces: String,

    /// Users allowed to set the user.info annotation (comma-separated regular
    /// expressions).
    #[clap(long, default_value = "", env = "ADMISSION_CONTROLLER_EXTERNAL_USERS")]
    external_users: String,

    /// Groups allowed to set the user.info annotation (comma-separated
    /// regular expressions).
    #[clap(long, default_value = "", env = "ADMISSION_CONTROLLER_EXTERNAL_GROUPS")]
    external_groups: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            namespace,
            scheduler_service_address,
            scheduler_timeout_ms,
            bypass_auth,
            process_namespaces,
            bypass_namespaces,
            label_namespaces,
            no_label_namespaces,
            external_users,
            external_groups,
        } = self;

        // Patterns are compiled exactly once; a bad pattern aborts startup
        // rather than surfacing during reviews.
        let filter = NamespaceFilter::new(
            &process_namespaces,
            &bypass_namespaces,
            &label_namespaces,
            &no_label_namespaces,
        )
        .context("invalid namespace policy configuration")?;
        let external_users =
            parse_patterns(&external_users).context("invalid --external-users configuration")?;
        let external_groups =
            parse_patterns(&external_groups).context("invalid --external-groups configuration")?;

        let config = Arc::new(AdmissionConfig {
            namespace,
            bypass_auth,
            filter,
            external_users,
            external_groups,
            scheduler_service_address,
            scheduler_timeout: Duration::from_millis(scheduler_timeout_ms),
            config_maps: Default::default(),
        });

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("admission"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        warm_config_maps(runtime.client(), &config).await;

        let service = admission::Service::new(config, metrics);
        let runtime = runtime.spawn_server(move || service);

        info!("admission controller ready");

        // Block on the shutdown signal, then let in-flight reviews drain.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}

/// Primes the ConfigMap slots so the first configuration review merges
/// against current state. The maps may legitimately not exist yet.
async fn warm_config_maps(client: kube::Client, config: &AdmissionConfig) {
    let api = Api::<ConfigMap>::namespaced(client, &config.namespace);
    for (name, slot) in [
        (config::DEFAULT_CONFIG_MAP_NAME, ConfigMapSlot::Defaults),
        (config::CONFIG_MAP_NAME, ConfigMapSlot::Overrides),
    ] {
        match api.get_opt(name).await {
            Ok(Some(config_map)) => {
                config.store_config_map(slot, config_map);
                info!(%name, "loaded scheduler ConfigMap");
            }
            Ok(None) => info!(%name, "scheduler ConfigMap not present"),
            Err(error) => warn!(%error, %name, "failed to load scheduler ConfigMap"),
        }
    }
}
