pub mod acme;
pub mod certs;
pub mod cluster;
pub mod config;
pub mod debounce;
pub mod dirty_state;
pub mod event;
pub mod listers;
pub mod object_key;
pub mod resolver;
pub mod terminating;
pub mod writer;

pub use acme::{AcmeCertificate, AcmeStore};
pub use certs::{CertificateIdentity, CertificateStore, ParsedCertificate};
pub use cluster::ClusterCache;
pub use config::{CacheConfig, ControllerIdentity, IngressClassFilter};
pub use debounce::UpdateNotifier;
pub use dirty_state::{
    ChangeSet, ConfigData, ConfigSnapshot, CredentialInvalidator, DirtySnapshot,
    DirtyStateAggregator,
};
pub use event::{ChangeEvent, ResourceKind, WatchedObject};
pub use listers::{Listers, ObjectLister};
pub use object_key::ObjectKey;
pub use resolver::{CaFiles, CredentialFile, CrtFile, SecretResolver};
pub use terminating::{is_terminating, terminating_pods};
pub use writer::{RemoteWriter, create_or_update};
