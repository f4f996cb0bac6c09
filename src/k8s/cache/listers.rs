/**
 * Read access to the local mirrors kept by the watch layer
 */
use super::object_key::ObjectKey;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use kube::runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;

/// Synchronous get/list over a local mirror of one kind
pub trait ObjectLister<K>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>>;

    fn list(&self) -> Vec<Arc<K>>;

    fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>>
    where
        K: ResourceExt,
    {
        self.list()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .collect()
    }
}

impl<K> ObjectLister<K> for Store<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let obj_ref = if key.namespace.is_empty() {
            ObjectRef::new(&key.name)
        } else {
            ObjectRef::new(&key.name).within(&key.namespace)
        };
        Store::get(self, &obj_ref)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.state()
    }
}

/// Mirrors of every kind the controller watches
#[derive(Clone)]
pub struct Listers {
    pub ingresses: Arc<dyn ObjectLister<Ingress>>,
    pub services: Arc<dyn ObjectLister<Service>>,
    pub endpoints: Arc<dyn ObjectLister<Endpoints>>,
    pub secrets: Arc<dyn ObjectLister<Secret>>,
    pub config_maps: Arc<dyn ObjectLister<ConfigMap>>,
    pub pods: Arc<dyn ObjectLister<Pod>>,
}

impl Listers {
    /// Listers backed by reflector stores
    #[must_use]
    pub fn from_stores(
        ingresses: Store<Ingress>,
        services: Store<Service>,
        endpoints: Store<Endpoints>,
        secrets: Store<Secret>,
        config_maps: Store<ConfigMap>,
        pods: Store<Pod>,
    ) -> Self {
        Self {
            ingresses: Arc::new(ingresses),
            services: Arc::new(services),
            endpoints: Arc::new(endpoints),
            secrets: Arc::new(secrets),
            config_maps: Arc::new(config_maps),
            pods: Arc::new(pods),
        }
    }
}

impl std::fmt::Debug for Listers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listers").finish_non_exhaustive()
    }
}
