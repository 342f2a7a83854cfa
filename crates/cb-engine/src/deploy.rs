//! Deployment orchestration
//!
//! `run_deployment` drives the full CloudBox Install Protocol flow against
//! one host: open a session, sync the repository, validate the manifest,
//! run `install`, probe the configured ports, run `start`, verify with the
//! `status` script. The session is closed on every exit path.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use cb_core::config::EngineConfig;
use cb_core::types::{DeploymentDescriptor, HostConfig};
use cb_protocol::lifecycle::LifecycleScript;
use cb_protocol::manifest::{Manifest, MANIFEST_FILE};
use cb_protocol::output::OutputChannel;

use crate::error::EngineError;
use crate::execute::run_lifecycle_script;
use crate::ports::{check_port_availability, PortStatus};
use crate::router::OutputRouter;
use crate::session::Session;
use crate::shell::shell_escape;
use crate::transport::CommandRunner;
use crate::validate::validate_compliance;

/// Repository to place at the deployment path before the scripts run.
#[derive(Clone)]
pub struct RepositorySpec {
    pub clone_url: String,
    pub branch: String,
    /// Specific commit to check out. `None`, empty, or `"latest"` keeps
    /// the branch head.
    pub commit: Option<String>,
    /// Token embedded into https clone URLs. Executed but never echoed.
    pub access_token: Option<String>,
}

// Debug omits the access token.
impl std::fmt::Debug for RepositorySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositorySpec")
            .field("clone_url", &self.clone_url)
            .field("branch", &self.branch)
            .field("commit", &self.commit)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Timing summary of a successful deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeploymentOutcome {
    /// Repository sync plus the install script, in milliseconds
    pub build_millis: u64,
    /// The start script, in milliseconds
    pub deploy_millis: u64,
}

/// Run the full deployment flow against `host`.
///
/// When `repository` is `None` the deployment path is expected to already
/// hold the application; only the manifest-driven part of the flow runs.
pub async fn run_deployment(
    config: EngineConfig,
    host: &HostConfig,
    deployment: &DeploymentDescriptor,
    repository: Option<&RepositorySpec>,
    router: &OutputRouter,
    cancel: CancellationToken,
) -> Result<DeploymentOutcome, EngineError> {
    let mut session = Session::open(config, host, deployment, cancel).await?;
    let result = deployment_flow(&mut session, deployment, repository, router).await;
    if let Err(e) = session.close().await {
        tracing::warn!("Session teardown after deployment reported: {}", e);
    }
    result
}

/// Open a session and run a single lifecycle script.
///
/// Validation still runs first; a manifest that fails compliance fails the
/// call before anything executes.
pub async fn run_script(
    config: EngineConfig,
    host: &HostConfig,
    deployment: &DeploymentDescriptor,
    script: LifecycleScript,
    router: &OutputRouter,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let mut session = Session::open(config, host, deployment, cancel).await?;
    let deploy_path = session.deploy_path().to_string();
    let result = async {
        let manifest = validate_compliance(&session, &deploy_path, router).await?;
        run_lifecycle_script(&mut session, &manifest, script, router).await
    }
    .await;
    if let Err(e) = session.close().await {
        tracing::warn!("Session teardown after '{}' reported: {}", script, e);
    }
    result
}

async fn deployment_flow(
    session: &mut Session,
    deployment: &DeploymentDescriptor,
    repository: Option<&RepositorySpec>,
    router: &OutputRouter,
) -> Result<DeploymentOutcome, EngineError> {
    let deploy_path = session.deploy_path().to_string();
    router
        .info(format!(
            "[CIP] Starting deployment '{}' at {}",
            deployment.name, deploy_path
        ))
        .await;

    let build_started = Instant::now();
    if let Some(repository) = repository {
        sync_repository(&*session, &deploy_path, session.environment(), repository, router)
            .await?;
    }

    // The manifest arrives with the repository, so validation runs after
    // the sync and fresh on every deployment.
    let manifest = validate_compliance(&*session, &deploy_path, router).await?;

    run_lifecycle_script(session, &manifest, LifecycleScript::Install, router).await?;
    let build_millis = build_started.elapsed().as_millis() as u64;

    warn_busy_ports(&*session, deployment, router).await;

    let deploy_started = Instant::now();
    run_lifecycle_script(session, &manifest, LifecycleScript::Start, router).await?;
    let deploy_millis = deploy_started.elapsed().as_millis() as u64;

    verify_deployment(session, &manifest, &deploy_path, router).await?;

    router.info("[CIP] Deployment completed successfully").await;
    Ok(DeploymentOutcome {
        build_millis,
        deploy_millis,
    })
}

/// Clone or update the repository at the deployment path.
///
/// An existing checkout is fast-forwarded with `fetch` + `reset --hard`
/// instead of recloned. A pinned commit that cannot be checked out
/// downgrades to a warning and the branch head is used.
pub async fn sync_repository<R>(
    runner: &R,
    deploy_path: &str,
    environment: &BTreeMap<String, String>,
    repository: &RepositorySpec,
    router: &OutputRouter,
) -> Result<(), EngineError>
where
    R: CommandRunner + ?Sized,
{
    router
        .info(format!("[CIP] Syncing repository into {}", deploy_path))
        .await;

    let mkdir = format!("mkdir -p {}", shell_escape(deploy_path));
    run_step(runner, environment, router, "Create deployment directory", &mkdir, &mkdir).await?;

    let display_url = normalize_clone_url(&repository.clone_url);
    let clone_url = authenticated_clone_url(&display_url, repository.access_token.as_deref());

    let sync = sync_command(deploy_path, &repository.branch, &clone_url);
    let sync_display = sync_command(deploy_path, &repository.branch, &display_url);
    run_step(runner, environment, router, "Repository sync", &sync, &sync_display).await?;

    if let Some(commit) = pinned_commit(repository) {
        let checkout = format!(
            "cd {} && git fetch --depth 1 origin {} && git checkout {}",
            deploy_path, commit, commit
        );
        if let Err(e) =
            run_step(runner, environment, router, "Commit checkout", &checkout, &checkout).await
        {
            tracing::warn!("Commit {} checkout failed: {}", commit, e);
            router
                .info(format!(
                    "[CIP] Warning: could not check out commit {}, using branch head",
                    commit
                ))
                .await;
        }
    }

    router
        .info(format!("[CIP] Repository ready at {}", deploy_path))
        .await;
    Ok(())
}

/// Verify the deployment with the `status` script.
///
/// A failing status run downgrades to a basic file-presence check; only
/// cancellation is passed through untouched.
async fn verify_deployment(
    session: &mut Session,
    manifest: &Manifest,
    deploy_path: &str,
    router: &OutputRouter,
) -> Result<(), EngineError> {
    router
        .info("[CIP] Verifying deployment with the status script")
        .await;
    match run_lifecycle_script(session, manifest, LifecycleScript::Status, router).await {
        Ok(()) => Ok(()),
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(e) => {
            tracing::warn!("Status verification failed: {}", e);
            router
                .info("[CIP] Status script failed, performing basic verification")
                .await;
            basic_verification(&*session, session.environment(), deploy_path, router).await
        }
    }
}

async fn basic_verification<R>(
    runner: &R,
    environment: &BTreeMap<String, String>,
    deploy_path: &str,
    router: &OutputRouter,
) -> Result<(), EngineError>
where
    R: CommandRunner + ?Sized,
{
    let check = format!(
        "cd {} && if [ -f package.json ]; then echo \"Found package.json\"; fi && \
         if [ -f {} ]; then echo \"Found {}\"; fi",
        deploy_path, MANIFEST_FILE, MANIFEST_FILE
    );
    run_step(runner, environment, router, "Basic verification", &check, &check).await
}

/// Probe the deployment's configured ports and warn about busy ones.
///
/// Advisory only. A port already in use is often the previous version of
/// the same application, which the start script is about to replace.
async fn warn_busy_ports<R>(
    runner: &R,
    deployment: &DeploymentDescriptor,
    router: &OutputRouter,
) where
    R: CommandRunner + ?Sized,
{
    if deployment.ports.is_empty() {
        return;
    }
    let ports: Vec<u16> = deployment.ports.values().copied().collect();
    router
        .info(format!(
            "[CIP] Checking availability of {} configured port(s)",
            ports.len()
        ))
        .await;
    let statuses = check_port_availability(runner, &ports).await;
    tracing::debug!("Port probe results: {:?}", statuses);
    for (name, port) in &deployment.ports {
        if statuses.get(port) == Some(&PortStatus::InUse) {
            router
                .info(format!(
                    "[CIP] Warning: port {} ({}) is already in use",
                    port, name
                ))
                .await;
        }
    }
}

/// Run one orchestration command over an ephemeral channel.
///
/// The environment travels as an `export` prefix since auxiliary commands
/// do not share the primary channel's sourced state. Only `display` is
/// echoed, so credentials embedded in the executed command stay private.
async fn run_step<R>(
    runner: &R,
    environment: &BTreeMap<String, String>,
    router: &OutputRouter,
    step: &str,
    command: &str,
    display: &str,
) -> Result<(), EngineError>
where
    R: CommandRunner + ?Sized,
{
    router.info(format!("$ {}", display)).await;
    let full_command = format!("{}{}", export_prefix(environment), command);
    let result = runner.run_command(&full_command).await?;
    if result.success() {
        router.forward(&result.output, OutputChannel::Stdout).await;
        Ok(())
    } else {
        router.forward(&result.output, OutputChannel::Stderr).await;
        Err(EngineError::CommandFailed {
            step: step.to_string(),
            detail: result.exit_detail(),
        })
    }
}

fn export_prefix(environment: &BTreeMap<String, String>) -> String {
    environment
        .iter()
        .map(|(key, value)| format!("export {}=\"{}\"; ", key, value))
        .collect()
}

/// `git@github.com:` remotes become https URLs; SSH agent forwarding is
/// not available inside the engine.
fn normalize_clone_url(url: &str) -> String {
    match url.strip_prefix("git@github.com:") {
        Some(rest) => format!("https://github.com/{}", rest),
        None => url.to_string(),
    }
}

fn authenticated_clone_url(url: &str, access_token: Option<&str>) -> String {
    match access_token {
        Some(token) if !token.is_empty() => match url.strip_prefix("https://github.com/") {
            Some(rest) => format!("https://{}@github.com/{}", token, rest),
            None => url.to_string(),
        },
        _ => url.to_string(),
    }
}

fn sync_command(deploy_path: &str, branch: &str, clone_url: &str) -> String {
    format!(
        r#"cd {path} &&
if [ ! -d .git ]; then
    echo "Directory is empty or not a git repo, cloning..." &&
    git clone --depth 1 -b {branch} {url} . &&
    echo "Repository cloned successfully"
else
    echo "Git repository exists, updating..." &&
    git remote set-url origin {url} &&
    git fetch origin {branch} --depth=1 &&
    git reset --hard origin/{branch} &&
    echo "Repository updated successfully"
fi"#,
        path = deploy_path,
        branch = branch,
        url = clone_url
    )
}

fn pinned_commit(repository: &RepositorySpec) -> Option<&str> {
    match repository.commit.as_deref() {
        Some("") | Some("latest") | None => None,
        Some(commit) => Some(commit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RepositorySpec {
        RepositorySpec {
            clone_url: "https://github.com/acme/app.git".to_string(),
            branch: "main".to_string(),
            commit: None,
            access_token: None,
        }
    }

    #[test]
    fn test_ssh_urls_become_https() {
        assert_eq!(
            normalize_clone_url("git@github.com:acme/app.git"),
            "https://github.com/acme/app.git"
        );
        assert_eq!(
            normalize_clone_url("https://github.com/acme/app.git"),
            "https://github.com/acme/app.git"
        );
    }

    #[test]
    fn test_token_embeds_into_github_https_urls_only() {
        assert_eq!(
            authenticated_clone_url("https://github.com/acme/app.git", Some("tok")),
            "https://tok@github.com/acme/app.git"
        );
        assert_eq!(
            authenticated_clone_url("https://gitlab.example/app.git", Some("tok")),
            "https://gitlab.example/app.git"
        );
        assert_eq!(
            authenticated_clone_url("https://github.com/acme/app.git", Some("")),
            "https://github.com/acme/app.git"
        );
        assert_eq!(
            authenticated_clone_url("https://github.com/acme/app.git", None),
            "https://github.com/acme/app.git"
        );
    }

    #[test]
    fn test_sync_command_clones_or_updates() {
        let command = sync_command("/srv/app", "main", "https://github.com/acme/app.git");
        assert!(command.starts_with("cd /srv/app &&"));
        assert!(command.contains("git clone --depth 1 -b main https://github.com/acme/app.git ."));
        assert!(command.contains("git remote set-url origin https://github.com/acme/app.git"));
        assert!(command.contains("git fetch origin main --depth=1"));
        assert!(command.contains("git reset --hard origin/main"));
    }

    #[test]
    fn test_display_command_never_carries_the_token() {
        let display_url = normalize_clone_url("git@github.com:acme/app.git");
        let clone_url = authenticated_clone_url(&display_url, Some("sekrit"));

        let display = sync_command("/srv/app", "main", &display_url);
        let executed = sync_command("/srv/app", "main", &clone_url);

        assert!(executed.contains("sekrit"));
        assert!(!display.contains("sekrit"));
    }

    #[test]
    fn test_pinned_commit_skips_latest_and_empty() {
        let mut repository = spec();
        assert_eq!(pinned_commit(&repository), None);
        repository.commit = Some("latest".to_string());
        assert_eq!(pinned_commit(&repository), None);
        repository.commit = Some(String::new());
        assert_eq!(pinned_commit(&repository), None);
        repository.commit = Some("abc123".to_string());
        assert_eq!(pinned_commit(&repository), Some("abc123"));
    }

    #[test]
    fn test_export_prefix_is_sorted_and_quoted() {
        let mut environment = BTreeMap::new();
        environment.insert("CLOUDBOX_PROJECT_ID".to_string(), "7".to_string());
        environment.insert("CLOUDBOX_API_URL".to_string(), "https://x/api".to_string());

        assert_eq!(
            export_prefix(&environment),
            "export CLOUDBOX_API_URL=\"https://x/api\"; export CLOUDBOX_PROJECT_ID=\"7\"; "
        );
    }

    #[test]
    fn test_export_prefix_empty_environment() {
        assert_eq!(export_prefix(&BTreeMap::new()), "");
    }
}
