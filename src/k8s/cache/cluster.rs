/**
 * Typed lookups over the local mirrors
 */
use super::config::ControllerIdentity;
use super::listers::{Listers, ObjectLister};
use super::object_key::ObjectKey;
use super::terminating;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ClusterCache {
    listers: Listers,
}

impl ClusterCache {
    #[must_use]
    pub const fn new(listers: Listers) -> Self {
        Self { listers }
    }

    #[must_use]
    pub const fn listers(&self) -> &Listers {
        &self.listers
    }

    /// # Errors
    ///
    /// Returns a parse error for a malformed key, `NotFound` if absent.
    pub fn get_ingress(&self, key: &str) -> Result<Arc<Ingress>> {
        lookup(self.listers.ingresses.as_ref(), key)
    }

    #[must_use]
    pub fn list_ingresses(&self) -> Vec<Arc<Ingress>> {
        self.listers.ingresses.list()
    }

    /// # Errors
    ///
    /// Returns a parse error for a malformed key, `NotFound` if absent.
    pub fn get_service(&self, key: &str) -> Result<Arc<Service>> {
        lookup(self.listers.services.as_ref(), key)
    }

    /// # Errors
    ///
    /// Returns a parse error for a malformed key, `NotFound` if absent.
    pub fn get_secret(&self, key: &str) -> Result<Arc<Secret>> {
        lookup(self.listers.secrets.as_ref(), key)
    }

    /// # Errors
    ///
    /// Returns a parse error for a malformed key, `NotFound` if absent.
    pub fn get_config_map(&self, key: &str) -> Result<Arc<ConfigMap>> {
        lookup(self.listers.config_maps.as_ref(), key)
    }

    /// Endpoints object named after `service`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the service has no endpoints object yet.
    pub fn get_endpoints(&self, service: &Service) -> Result<Arc<Endpoints>> {
        let key = ObjectKey::from_resource(service);
        self.listers
            .endpoints
            .get(&key)
            .ok_or_else(|| Error::not_found(&key.namespace, &key.name))
    }

    /// # Errors
    ///
    /// Returns a parse error for a malformed key, `NotFound` if absent.
    pub fn get_pod(&self, key: &str) -> Result<Arc<Pod>> {
        lookup(self.listers.pods.as_ref(), key)
    }

    /// See [`terminating::terminating_pods`]
    ///
    /// # Errors
    ///
    /// Returns a parse error when the service selector is malformed.
    pub fn terminating_pods(&self, service: &Service) -> Result<Vec<Arc<Pod>>> {
        terminating::terminating_pods(self.listers.pods.as_ref(), service)
    }

    /// The pod this controller instance runs in
    ///
    /// # Errors
    ///
    /// Fails when `POD_NAMESPACE`/`POD_NAME` are unset or the pod is not mirrored.
    pub fn controller_pod(&self) -> Result<Arc<Pod>> {
        self.pod_of(&ControllerIdentity::from_env()?)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the pod is not mirrored.
    pub fn pod_of(&self, identity: &ControllerIdentity) -> Result<Arc<Pod>> {
        self.listers
            .pods
            .get(&identity.key())
            .ok_or_else(|| Error::not_found(&identity.namespace, &identity.pod_name))
    }
}

fn lookup<K>(lister: &dyn ObjectLister<K>, key: &str) -> Result<Arc<K>> {
    let key = ObjectKey::parse(key)?;
    lister
        .get(&key)
        .ok_or_else(|| Error::not_found(&key.namespace, &key.name))
}
