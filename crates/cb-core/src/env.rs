//! Deterministic environment construction
//!
//! Lifecycle scripts receive a fixed set of `CLOUDBOX_*` variables plus one
//! variable per configured port. Everything here is a pure function of the
//! deployment descriptor and host configuration: identical inputs always
//! yield an identical map, and the `BTreeMap` makes iteration order stable,
//! so the generated environment script is byte-identical across runs.

use std::collections::BTreeMap;

use cb_protocol::CIP_VERSION;

use crate::types::{DeploymentDescriptor, HostConfig};

/// Base URL injected as `CLOUDBOX_API_URL`, suffixed with the project id.
const API_URL_BASE: &str = "https://cloudbox.domain/api/projects";

/// Resolve the remote deployment path.
///
/// Precedence: the descriptor's explicit path, else the host's configured
/// base path joined with the deployment name, else the home-directory
/// convention `/home/<username>/deploys/<name>`. The name is sanitized
/// before it becomes a path component; an explicit path is taken as given.
pub fn resolve_deploy_path(deployment: &DeploymentDescriptor, host: &HostConfig) -> String {
    if let Some(path) = deployment.deploy_path.as_deref() {
        if !path.is_empty() {
            return path.to_string();
        }
    }
    let name = sanitize_deployment_name(&deployment.name);
    if let Some(base) = host.deploy_base_path.as_deref() {
        if !base.is_empty() {
            return format!("{}/{}", base, name);
        }
    }
    format!("/home/{}/deploys/{}", host.username, name)
}

/// Strip characters that are unsafe in remote directory names.
///
/// Spaces and path or glob metacharacters become underscores; runs of
/// underscores collapse to one and leading or trailing ones are trimmed.
pub fn sanitize_deployment_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    while sanitized.contains("__") {
        sanitized = sanitized.replace("__", "_");
    }

    sanitized.trim_matches('_').to_string()
}

/// Build the environment injected into every lifecycle script invocation.
///
/// The host configuration is part of the contract's inputs but currently
/// contributes nothing beyond the already-resolved path.
pub fn build_environment(
    deployment: &DeploymentDescriptor,
    _host: &HostConfig,
    deploy_path: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    env.insert(
        "CLOUDBOX_API_URL".to_string(),
        format!("{}/{}", API_URL_BASE, deployment.project_id),
    );
    env.insert(
        "CLOUDBOX_PROJECT_ID".to_string(),
        deployment.project_id.to_string(),
    );
    env.insert("CLOUDBOX_PROJECT_SLUG".to_string(), deployment.name.clone());
    env.insert("CLOUDBOX_DEPLOYMENT_ID".to_string(), deployment.id.to_string());
    env.insert(
        "CLOUDBOX_DEPLOYMENT_PATH".to_string(),
        deploy_path.to_string(),
    );
    env.insert(
        "CLOUDBOX_ENVIRONMENT".to_string(),
        "production".to_string(),
    );
    env.insert("CLOUDBOX_VERSION".to_string(), CIP_VERSION.to_string());
    env.insert("CLOUDBOX_DOCKER_ENABLED".to_string(), "true".to_string());

    for (name, port) in &deployment.ports {
        env.insert(
            format!("CLOUDBOX_{}_PORT", name.to_uppercase()),
            port.to_string(),
        );
    }

    // Distinguished alias for the conventional web port
    if let Some(web_port) = deployment.ports.get("web") {
        env.insert("CLOUDBOX_WEB_PORT".to_string(), web_port.to_string());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_protocol::ENV_VAR_PREFIX;

    fn descriptor() -> DeploymentDescriptor {
        DeploymentDescriptor {
            id: 42,
            project_id: 7,
            name: "api".to_string(),
            deploy_path: None,
            ports: BTreeMap::new(),
        }
    }

    fn host() -> HostConfig {
        HostConfig {
            hostname: "web-1".to_string(),
            port: 22,
            username: "deploy".to_string(),
            private_key: String::new(),
            deploy_base_path: None,
        }
    }

    #[test]
    fn test_explicit_path_wins() {
        let mut deployment = descriptor();
        deployment.deploy_path = Some("/a".to_string());
        let mut host = host();
        host.deploy_base_path = Some("/srv".to_string());

        assert_eq!(resolve_deploy_path(&deployment, &host), "/a");
    }

    #[test]
    fn test_base_path_joined_with_name() {
        let mut deployment = descriptor();
        deployment.name = "app".to_string();
        let mut host = host();
        host.deploy_base_path = Some("/srv".to_string());

        assert_eq!(resolve_deploy_path(&deployment, &host), "/srv/app");
    }

    #[test]
    fn test_home_directory_convention() {
        assert_eq!(
            resolve_deploy_path(&descriptor(), &host()),
            "/home/deploy/deploys/api"
        );
    }

    #[test]
    fn test_name_is_sanitized_in_derived_paths() {
        let mut deployment = descriptor();
        deployment.name = "My App:v2".to_string();
        let mut host = host();
        host.deploy_base_path = Some("/srv".to_string());

        assert_eq!(resolve_deploy_path(&deployment, &host), "/srv/My_App_v2");

        host.deploy_base_path = None;
        assert_eq!(
            resolve_deploy_path(&deployment, &host),
            "/home/deploy/deploys/My_App_v2"
        );
    }

    #[test]
    fn test_sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_deployment_name("My App/v2"), "My_App_v2");
        assert_eq!(sanitize_deployment_name("a:b*c?d"), "a_b_c_d");
    }

    #[test]
    fn test_sanitize_collapses_and_trims_underscores() {
        assert_eq!(sanitize_deployment_name("  api | web  "), "api_web");
        assert_eq!(sanitize_deployment_name("___"), "");
    }

    #[test]
    fn test_empty_strings_do_not_shadow_fallbacks() {
        let mut deployment = descriptor();
        deployment.deploy_path = Some(String::new());
        let mut host = host();
        host.deploy_base_path = Some(String::new());

        assert_eq!(
            resolve_deploy_path(&deployment, &host),
            "/home/deploy/deploys/api"
        );
    }

    #[test]
    fn test_environment_core_set() {
        let env = build_environment(&descriptor(), &host(), "/var/www/api");

        assert_eq!(
            env.get("CLOUDBOX_API_URL").map(String::as_str),
            Some("https://cloudbox.domain/api/projects/7")
        );
        assert_eq!(env.get("CLOUDBOX_PROJECT_ID").map(String::as_str), Some("7"));
        assert_eq!(env.get("CLOUDBOX_PROJECT_SLUG").map(String::as_str), Some("api"));
        assert_eq!(env.get("CLOUDBOX_DEPLOYMENT_ID").map(String::as_str), Some("42"));
        assert_eq!(
            env.get("CLOUDBOX_DEPLOYMENT_PATH").map(String::as_str),
            Some("/var/www/api")
        );
        assert_eq!(
            env.get("CLOUDBOX_ENVIRONMENT").map(String::as_str),
            Some("production")
        );
        assert_eq!(env.get("CLOUDBOX_VERSION").map(String::as_str), Some("1.0"));
        assert_eq!(
            env.get("CLOUDBOX_DOCKER_ENABLED").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_port_variables_and_web_alias() {
        let mut deployment = descriptor();
        deployment.ports.insert("web".to_string(), 3000);
        deployment.ports.insert("metrics".to_string(), 9090);

        let env = build_environment(&deployment, &host(), "/srv/api");

        assert_eq!(env.get("CLOUDBOX_WEB_PORT").map(String::as_str), Some("3000"));
        assert_eq!(
            env.get("CLOUDBOX_METRICS_PORT").map(String::as_str),
            Some("9090")
        );
    }

    #[test]
    fn test_no_web_alias_without_web_port() {
        let mut deployment = descriptor();
        deployment.ports.insert("metrics".to_string(), 9090);

        let env = build_environment(&deployment, &host(), "/srv/api");
        assert!(!env.contains_key("CLOUDBOX_WEB_PORT"));
    }

    #[test]
    fn test_environment_is_deterministic() {
        let mut deployment = descriptor();
        deployment.ports.insert("web".to_string(), 3000);
        deployment.ports.insert("db".to_string(), 5432);
        let host = host();

        let first = build_environment(&deployment, &host, "/srv/api");
        let second = build_environment(&deployment, &host, "/srv/api");

        assert_eq!(first, second);
        // Byte-identical when rendered in iteration order
        let render = |env: &BTreeMap<String, String>| {
            env.iter()
                .map(|(k, v)| format!("{}={}\n", k, v))
                .collect::<String>()
        };
        assert_eq!(render(&first), render(&second));
    }

    #[test]
    fn test_every_variable_carries_the_prefix() {
        let mut deployment = descriptor();
        deployment.ports.insert("web".to_string(), 3000);

        let env = build_environment(&deployment, &host(), "/srv/api");
        for key in env.keys() {
            assert!(key.starts_with(ENV_VAR_PREFIX), "unexpected key {}", key);
        }
    }

    #[test]
    fn test_end_to_end_scenario_id_42() {
        // Deployment 42, user "deploy", no explicit path, base /var/www, name "api"
        let mut deployment = descriptor();
        deployment.name = "api".to_string();
        let mut host = host();
        host.deploy_base_path = Some("/var/www".to_string());

        let path = resolve_deploy_path(&deployment, &host);
        assert_eq!(path, "/var/www/api");

        let env = build_environment(&deployment, &host, &path);
        assert_eq!(
            env.get("CLOUDBOX_DEPLOYMENT_PATH").map(String::as_str),
            Some("/var/www/api")
        );
        assert_eq!(env.get("CLOUDBOX_DEPLOYMENT_ID").map(String::as_str), Some("42"));
    }
}
