use anyhow::Context;
use clap::Parser;
use ingress_cache::k8s::cache::config::{
    DEFAULT_ACME_SECRET_KEY_NAME, DEFAULT_ACME_TOKEN_CONFIGMAP_NAME, DEFAULT_CERTIFICATE_DIR,
    DEFAULT_INGRESS_CLASS, TLS_CERT_ENTRY,
};
use ingress_cache::k8s::cache::{
    AcmeStore, CacheConfig, CertificateStore, ClusterCache, DirtySnapshot, DirtyStateAggregator,
    IngressClassFilter, ObjectKey, RemoteWriter, SecretResolver, config,
};
use ingress_cache::k8s::watch::WatchManager;
use ingress_cache::k8s::{USER_AGENT, client};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch, all namespaces when omitted
    #[arg(short, long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Allow ingresses to reference secrets in other namespaces
    #[arg(long, env = "ALLOW_CROSS_NAMESPACE")]
    allow_cross_namespace: bool,

    /// Global config map, `namespace/name` or a name in the controller namespace
    #[arg(long)]
    configmap: Option<String>,

    /// Config map of exposed TCP services
    #[arg(long)]
    tcp_services_configmap: Option<String>,

    /// Secret holding the ACME account key
    #[arg(long, default_value = DEFAULT_ACME_SECRET_KEY_NAME)]
    acme_secret_key_name: String,

    /// Config map holding ACME HTTP-01 challenge tokens
    #[arg(long, default_value = DEFAULT_ACME_TOKEN_CONFIGMAP_NAME)]
    acme_token_configmap_name: String,

    /// Prepare the ACME account key at startup
    #[arg(long)]
    acme: bool,

    /// Ingress class handled by this controller
    #[arg(long, default_value = DEFAULT_INGRESS_CLASS)]
    ingress_class: String,

    /// Skip ingresses that do not name a class
    #[arg(long)]
    ignore_ingress_without_class: bool,

    /// Directory for resolved certificate, CA and DH files
    #[arg(long, default_value = DEFAULT_CERTIFICATE_DIR)]
    certificate_dir: PathBuf,

    /// Seconds between forced syncs
    #[arg(long, default_value_t = 60)]
    resync_interval: u64,

    /// Log level used when `RUST_LOG` is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn cache_config(&self, controller_namespace: &str) -> anyhow::Result<CacheConfig> {
        let mut config = CacheConfig::new(controller_namespace)
            .with_acme_secret_key_name(controller_namespace, &self.acme_secret_key_name)?
            .with_acme_token_config_map(controller_namespace, &self.acme_token_configmap_name)?;
        config.allow_cross_namespace = self.allow_cross_namespace;
        config.global_config_map = self
            .configmap
            .as_deref()
            .map(|r| ObjectKey::qualified(controller_namespace, r))
            .transpose()?;
        config.tcp_config_map = self
            .tcp_services_configmap
            .as_deref()
            .map(|r| ObjectKey::qualified(controller_namespace, r))
            .transpose()?;
        config.certificate_dir.clone_from(&self.certificate_dir);
        config.ingress_class = IngressClassFilter {
            class: self.ingress_class.clone(),
            accept_without_class: !self.ignore_ingress_without_class,
        };
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        debug!("A rustls crypto provider was already installed");
    }

    let controller_namespace = config::controller_namespace();
    let config = args.cache_config(&controller_namespace)?;
    info!("🚀 Starting {} in {}", USER_AGENT, controller_namespace);

    let client = client::new(Some(USER_AGENT))
        .await
        .context("failed to create kubernetes client")?;

    let manager = WatchManager::new(client.clone(), args.namespace.clone(), &config);
    let listers = manager.listers();

    let certificates = Arc::new(CertificateStore::new(&config.certificate_dir));
    let notify = Arc::new(Notify::new());
    let aggregator = Arc::new(
        DirtyStateAggregator::new(&config, notify.clone()).with_invalidator(certificates.clone()),
    );
    let resolver = SecretResolver::new(
        config.allow_cross_namespace,
        Arc::clone(&listers.secrets),
        certificates,
    );
    let secret_writer: Arc<dyn RemoteWriter<Secret>> = Arc::new(client.clone());
    let config_map_writer: Arc<dyn RemoteWriter<ConfigMap>> = Arc::new(client);
    let acme = AcmeStore::new(
        config.acme_secret_key_name.clone(),
        config.acme_token_config_map.clone(),
        Arc::clone(&listers.secrets),
        Arc::clone(&listers.config_maps),
        secret_writer,
        config_map_writer,
    );
    let cluster = ClusterCache::new(listers);

    let mut handle = manager.start(Arc::clone(&aggregator));

    if args.acme {
        handle.wait_until_ready().await?;
        acme.signer()
            .await
            .context("failed to prepare the ACME account key")?;
        info!("🔑 ACME account key ready in {}", config.acme_secret_key_name);
    }
    match cluster.controller_pod() {
        Ok(pod) => debug!("Running as pod {}", pod.name_any()),
        Err(e) => debug!("Controller pod unknown: {}", e),
    }

    let mut resync = tokio::time::interval(Duration::from_secs(args.resync_interval.max(1)));
    loop {
        tokio::select! {
            () = notify.notified() => {}
            _ = resync.tick() => debug!("⏰ Periodic sync"),
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutting down");
                break;
            }
        }

        let snapshot = aggregator.sync();
        if !snapshot.is_empty() {
            report(&snapshot, &resolver, &cluster);
        }
    }

    handle.shutdown();
    Ok(())
}

/// Resolve what the changed objects reference and log the outcome
fn report(snapshot: &DirtySnapshot, resolver: &SecretResolver, cluster: &ClusterCache) {
    if let Some(data) = snapshot.global_config.effective().filter(|_| snapshot.global_config.changed()) {
        info!("⚙️  Global config now has {} entries", data.len());
    }
    if let Some(data) = snapshot.tcp_config.effective().filter(|_| snapshot.tcp_config.changed()) {
        info!("⚙️  TCP services config now has {} entries", data.len());
    }

    let ingresses = if snapshot.need_full_resync {
        cluster.list_ingresses()
    } else {
        snapshot
            .ingresses
            .added
            .iter()
            .chain(&snapshot.ingresses.updated)
            .cloned()
            .collect()
    };
    for ingress in &ingresses {
        let namespace = ingress.namespace().unwrap_or_default();
        let tls = ingress.spec.as_ref().and_then(|spec| spec.tls.as_ref());
        for secret_name in tls.into_iter().flatten().filter_map(|t| t.secret_name.as_deref()) {
            match resolver.tls_certificate(&namespace, secret_name) {
                Ok(crt) => info!(
                    "🔐 {}/{} uses {} (CN={}, expires {})",
                    namespace,
                    ingress.name_any(),
                    crt.filename.display(),
                    crt.common_name,
                    crt.not_after
                ),
                Err(e) => warn!("{}/{}: {}", namespace, ingress.name_any(), e),
            }
        }
    }

    for secret in snapshot.secrets.added.iter().chain(&snapshot.secrets.updated) {
        let has_tls = secret
            .data
            .as_ref()
            .is_some_and(|data| data.contains_key(TLS_CERT_ENTRY));
        if has_tls {
            let key = ObjectKey::from_resource(secret.as_ref());
            if let Err(e) = resolver.tls_certificate("", &key.to_string()) {
                warn!("Secret {} holds unusable TLS material: {}", key, e);
            }
        }
    }

    for service in snapshot.services.added.iter().chain(&snapshot.services.updated) {
        match cluster.terminating_pods(service) {
            Ok(pods) if !pods.is_empty() => info!(
                "⏳ {} pods of {}/{} draining",
                pods.len(),
                service.namespace().unwrap_or_default(),
                service.name_any()
            ),
            Ok(_) => {}
            Err(e) => warn!("Service {}: {}", service.name_any(), e),
        }
    }
}
