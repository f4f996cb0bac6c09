/**
 * Configuration constants and settings for the ingress change cache
 */
use super::object_key::ObjectKey;
use crate::error::{Error, Result};
use k8s_openapi::api::networking::v1::Ingress;
use std::path::PathBuf;
use std::time::Duration;

/// Delay between the first change of a quiet period and the update notification
pub const DEFAULT_DEBOUNCE_MILLIS: u64 = 500;

/// Well-known secret entries
pub const TLS_CERT_ENTRY: &str = "tls.crt";
pub const TLS_KEY_ENTRY: &str = "tls.key";
pub const CA_CERT_ENTRY: &str = "ca.crt";
pub const CA_CRL_ENTRY: &str = "ca.crl";
pub const DH_PARAM_ENTRY: &str = "dhparam.pem";

/// Secret type stamped on ACME-issued certificates
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

/// ACME account key size in bits
pub const ACME_KEY_BITS: usize = 2048;

pub const DEFAULT_ACME_SECRET_KEY_NAME: &str = "acme-private-key";
pub const DEFAULT_ACME_TOKEN_CONFIGMAP_NAME: &str = "acme-validation-tokens";

/// Pods terminated for this reason are unreachable and never kept for draining
pub const NODE_LOST_REASON: &str = "NodeLost";

/// Controller self-identification
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const POD_NAME_ENV: &str = "POD_NAME";
pub const FALLBACK_NAMESPACE: &str = "default";

pub const DEFAULT_CERTIFICATE_DIR: &str = "/var/lib/ingress-cache/ssl";

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub const DEFAULT_INGRESS_CLASS: &str = "haproxy";

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_DEBOUNCE_MILLIS > 0, "DEFAULT_DEBOUNCE_MILLIS must be greater than 0");
    assert!(ACME_KEY_BITS >= 2048, "ACME_KEY_BITS must be at least 2048");
};

/// Settings shared by the dirty-state aggregator, the resolvers and the watch binding
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Allow objects to reference secrets in other namespaces
    pub allow_cross_namespace: bool,
    /// Distinguished global config map
    pub global_config_map: Option<ObjectKey>,
    /// Distinguished tcp-services config map
    pub tcp_config_map: Option<ObjectKey>,
    pub acme_secret_key_name: ObjectKey,
    pub acme_token_config_map: ObjectKey,
    /// Where resolved TLS, CA and DH material is written
    pub certificate_dir: PathBuf,
    pub debounce_delay: Duration,
    pub ingress_class: IngressClassFilter,
}

impl CacheConfig {
    /// Defaults with the ACME objects living in `controller_namespace`
    #[must_use]
    pub fn new(controller_namespace: &str) -> Self {
        Self {
            allow_cross_namespace: false,
            global_config_map: None,
            tcp_config_map: None,
            acme_secret_key_name: ObjectKey::new(controller_namespace, DEFAULT_ACME_SECRET_KEY_NAME),
            acme_token_config_map: ObjectKey::new(
                controller_namespace,
                DEFAULT_ACME_TOKEN_CONFIGMAP_NAME,
            ),
            certificate_dir: PathBuf::from(DEFAULT_CERTIFICATE_DIR),
            debounce_delay: Duration::from_millis(DEFAULT_DEBOUNCE_MILLIS),
            ingress_class: IngressClassFilter::default(),
        }
    }

    /// Set the ACME account secret; a bare name lands in the controller namespace
    ///
    /// # Errors
    ///
    /// Returns a parse error for a malformed reference.
    pub fn with_acme_secret_key_name(mut self, controller_namespace: &str, reference: &str) -> Result<Self> {
        self.acme_secret_key_name = ObjectKey::qualified(controller_namespace, reference)?;
        Ok(self)
    }

    /// Set the ACME token config map; a bare name lands in the controller namespace
    ///
    /// # Errors
    ///
    /// Returns a parse error for a malformed reference.
    pub fn with_acme_token_config_map(mut self, controller_namespace: &str, reference: &str) -> Result<Self> {
        self.acme_token_config_map = ObjectKey::qualified(controller_namespace, reference)?;
        Ok(self)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(&controller_namespace())
    }
}

/// Namespace the controller runs in, `default` when `POD_NAMESPACE` is unset
#[must_use]
pub fn controller_namespace() -> String {
    std::env::var(POD_NAMESPACE_ENV)
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string())
}

/// Namespace and pod name of the running controller instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub namespace: String,
    pub pod_name: String,
}

impl ControllerIdentity {
    /// # Errors
    ///
    /// Returns an error if `POD_NAMESPACE` or `POD_NAME` is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            std::env::var(POD_NAMESPACE_ENV).ok(),
            std::env::var(POD_NAME_ENV).ok(),
        )
    }

    fn from_values(namespace: Option<String>, pod_name: Option<String>) -> Result<Self> {
        match (namespace, pod_name) {
            (Some(namespace), Some(pod_name)) if !namespace.is_empty() && !pod_name.is_empty() => {
                Ok(Self {
                    namespace,
                    pod_name,
                })
            }
            _ => Err(Error::Custom(format!(
                "missing {POD_NAMESPACE_ENV} or {POD_NAME_ENV} envvar"
            ))),
        }
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.pod_name)
    }
}

/// Decides which ingresses belong to this controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressClassFilter {
    pub class: String,
    /// Accept ingresses that name no class at all
    pub accept_without_class: bool,
}

impl Default for IngressClassFilter {
    fn default() -> Self {
        Self {
            class: DEFAULT_INGRESS_CLASS.to_string(),
            accept_without_class: true,
        }
    }
}

impl IngressClassFilter {
    /// `spec.ingressClassName` wins over the legacy annotation
    #[must_use]
    pub fn accepts(&self, ingress: &Ingress) -> bool {
        let class_name = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.ingress_class_name.as_deref());
        let annotation = ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(INGRESS_CLASS_ANNOTATION))
            .map(String::as_str);

        class_name
            .or(annotation)
            .map_or(self.accept_without_class, |class| class == self.class)
    }
}
