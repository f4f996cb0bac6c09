use super::object_key::ObjectKey;
use derive_more::From;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::fmt;
use std::sync::Arc;

/// Categories of cluster objects the controller watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Ingress,
    Service,
    Endpoints,
    Secret,
    ConfigMap,
    Pod,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ingress => "ingress",
            Self::Service => "service",
            Self::Endpoints => "endpoints",
            Self::Secret => "secret",
            Self::ConfigMap => "configmap",
            Self::Pod => "pod",
        };
        f.write_str(name)
    }
}

/// A watched object tagged with its kind
#[derive(Debug, Clone, From)]
pub enum WatchedObject {
    Ingress(Arc<Ingress>),
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    Secret(Arc<Secret>),
    ConfigMap(Arc<ConfigMap>),
    Pod(Arc<Pod>),
}

impl WatchedObject {
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Ingress(_) => ResourceKind::Ingress,
            Self::Service(_) => ResourceKind::Service,
            Self::Endpoints(_) => ResourceKind::Endpoints,
            Self::Secret(_) => ResourceKind::Secret,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Pod(_) => ResourceKind::Pod,
        }
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Ingress(obj) => ObjectKey::from_resource(obj.as_ref()),
            Self::Service(obj) => ObjectKey::from_resource(obj.as_ref()),
            Self::Endpoints(obj) => ObjectKey::from_resource(obj.as_ref()),
            Self::Secret(obj) => ObjectKey::from_resource(obj.as_ref()),
            Self::ConfigMap(obj) => ObjectKey::from_resource(obj.as_ref()),
            Self::Pod(obj) => ObjectKey::from_resource(obj.as_ref()),
        }
    }
}

/// A change delivered by the watch layer
///
/// Both sides absent is a full-resync request.
#[derive(Debug, Clone, Default)]
pub struct ChangeEvent {
    pub old: Option<WatchedObject>,
    pub new: Option<WatchedObject>,
}

impl ChangeEvent {
    pub fn added(obj: impl Into<WatchedObject>) -> Self {
        Self {
            old: None,
            new: Some(obj.into()),
        }
    }

    pub fn updated(old: impl Into<WatchedObject>, new: impl Into<WatchedObject>) -> Self {
        Self {
            old: Some(old.into()),
            new: Some(new.into()),
        }
    }

    pub fn deleted(old: impl Into<WatchedObject>) -> Self {
        Self {
            old: Some(old.into()),
            new: None,
        }
    }

    #[must_use]
    pub fn resync() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn kind(&self) -> Option<ResourceKind> {
        self.new.as_ref().or(self.old.as_ref()).map(WatchedObject::kind)
    }
}
