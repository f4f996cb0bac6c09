// Client creation with custom user-agent support for kube 2.x
use super::USER_AGENT_ENV;
use crate::error::Result as IcResult;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::warn;

/// Create a new k8s client to interact with the cluster api
///
/// The `INGRESS_CACHE_USER_AGENT` environment variable takes precedence over
/// `custom_user_agent`.
///
/// # Errors
///
/// Will return `Err` if the kube config can not be inferred or the client can not be built
pub async fn new(custom_user_agent: Option<&str>) -> IcResult<Client> {
    let mut config = Config::infer().await?;

    let override_agent = std::env::var(USER_AGENT_ENV).ok();
    if let Some(user_agent) = effective_user_agent(override_agent.as_deref(), custom_user_agent) {
        match HeaderValue::from_str(user_agent) {
            Ok(header_value) => config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value)),
            // fall back to kube's default user-agent
            Err(e) => warn!("Ignoring invalid user-agent '{}': {}", user_agent, e),
        }
    }

    let client = Client::try_from(config)?;

    Ok(client)
}

fn effective_user_agent<'a>(
    env_override: Option<&'a str>,
    custom: Option<&'a str>,
) -> Option<&'a str> {
    env_override.filter(|agent| !agent.is_empty()).or(custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_override_wins() {
        assert_eq!(
            effective_user_agent(Some("ops/1.0"), Some("ingress-cache/0.1")),
            Some("ops/1.0")
        );
        assert_eq!(
            effective_user_agent(Some(""), Some("ingress-cache/0.1")),
            Some("ingress-cache/0.1")
        );
        assert_eq!(effective_user_agent(None, None), None);
    }
}
