use super::config::NODE_LOST_REASON;
use super::listers::ObjectLister;
use crate::error::Result;
use crate::k8s::utils::LabelSelector;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::trace;

/// Being deleted, not lost with its node, and still reachable at its address
#[must_use]
pub fn is_terminating(pod: &Pod) -> bool {
    let status = pod.status.as_ref();
    let reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default();
    let pod_ip = status.and_then(|s| s.pod_ip.as_deref()).unwrap_or_default();

    pod.metadata.deletion_timestamp.is_some() && reason != NODE_LOST_REASON && !pod_ip.is_empty()
}

/// Terminating pods still selected by `service`, kept briefly for connection draining
///
/// A service without selector terms selects nothing.
///
/// # Errors
///
/// Returns a parse error when the service selector is malformed.
pub fn terminating_pods(pods: &dyn ObjectLister<Pod>, service: &Service) -> Result<Vec<Arc<Pod>>> {
    let selector = LabelSelector::from_map(
        &service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .unwrap_or_default(),
    )?;
    if selector.is_empty() {
        return Ok(Vec::new());
    }

    let namespace = service.namespace().unwrap_or_default();
    let terminating: Vec<_> = pods
        .list_namespaced(&namespace)
        .into_iter()
        .filter(|pod| selector.matches(pod.metadata.labels.as_ref()) && is_terminating(pod))
        .collect();
    trace!(
        "{} terminating pods for service {}/{} ({})",
        terminating.len(),
        namespace,
        service.name_any(),
        selector
    );
    Ok(terminating)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::{reflector, watcher};
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn pod(name: &str, deleting: bool, reason: Option<&str>, pod_ip: Option<&str>) -> Pod {
        let deletion_timestamp = deleting.then_some("2026-10-19T12:00:00Z");
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "namespace": "web",
                "name": name,
                "labels": { "app": "web", "pod-template-hash": "abc" },
                "deletionTimestamp": deletion_timestamp,
            },
            "status": { "reason": reason, "podIP": pod_ip },
        }))
        .unwrap()
    }

    fn service(selector: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("web".to_string()),
                name: Some("web".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels(selector)),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn mirror(pods: Vec<Pod>) -> reflector::Store<Pod> {
        let (reader, mut writer) = reflector::store();
        for pod in pods {
            writer.apply_watcher_event(&watcher::Event::Apply(pod));
        }
        reader
    }

    #[test]
    fn test_terminating_conditions() {
        assert!(is_terminating(&pod("a", true, None, Some("10.0.0.1"))));
        assert!(is_terminating(&pod("a", true, Some(""), Some("10.0.0.1"))));
        assert!(!is_terminating(&pod("a", true, Some(NODE_LOST_REASON), Some("10.0.0.1"))));
        assert!(!is_terminating(&pod("a", false, None, Some("10.0.0.1"))));
        assert!(!is_terminating(&pod("a", true, None, Some(""))));
        assert!(!is_terminating(&pod("a", true, None, None)));
    }

    #[test]
    fn test_terminating_pods_for_service() {
        let mut other_namespace = pod("elsewhere", true, None, Some("10.0.0.9"));
        other_namespace.metadata.namespace = Some("api".to_string());
        let mut unlabelled = pod("unlabelled", true, None, Some("10.0.0.8"));
        unlabelled.metadata.labels = None;

        let pods = mirror(vec![
            pod("draining", true, None, Some("10.0.0.1")),
            pod("lost", true, Some(NODE_LOST_REASON), Some("10.0.0.2")),
            pod("running", false, None, Some("10.0.0.3")),
            other_namespace,
            unlabelled,
        ]);

        let selected = terminating_pods(&pods, &service(&[("app", "web")])).unwrap();
        let names: Vec<_> = selected.iter().map(|pod| pod.name_any()).collect();
        assert_eq!(names, vec!["draining"]);
    }

    #[test]
    fn test_empty_selector_selects_nothing() {
        let pods = mirror(vec![pod("draining", true, None, Some("10.0.0.1"))]);

        assert!(terminating_pods(&pods, &service(&[])).unwrap().is_empty());

        let mut no_spec = service(&[]);
        no_spec.spec = None;
        assert!(terminating_pods(&pods, &no_spec).unwrap().is_empty());
    }
}
