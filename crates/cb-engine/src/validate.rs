//! CIP compliance validation
//!
//! Confirms the remote application follows the CloudBox Install Protocol
//! before anything executes: the manifest must exist, and each required
//! lifecycle script must resolve to a file on disk. Script paths are
//! extracted on the remote host with jq when available; a grep/sed scan
//! stands in when it is not. The fallback only understands the flat
//! `scripts` object the protocol requires; nested objects or escaped
//! quotes can misparse.
//!
//! Validation runs fresh on every pass. A manifest edited between two
//! script runs is re-read, never cached.

use cb_protocol::{LifecycleScript, Manifest, OutputChannel, MANIFEST_FILE};

use crate::error::{EngineError, ValidationError};
use crate::router::OutputRouter;
use crate::transport::CommandRunner;

/// Validate CIP compliance and resolve the four lifecycle script paths.
///
/// Scripts are checked in the fixed lifecycle order and the first failure
/// stops the pass. A script that exists but is not executable is made
/// executable here rather than failing validation.
pub async fn validate_compliance<R>(
    runner: &R,
    deploy_path: &str,
    router: &OutputRouter,
) -> Result<Manifest, EngineError>
where
    R: CommandRunner + ?Sized,
{
    router
        .info("[CIP] Validating CloudBox Install Protocol compliance")
        .await;

    let check = format!("cd {} && test -f {}", deploy_path, MANIFEST_FILE);
    let result = runner.run_command(&check).await?;
    if !result.success() {
        router
            .error(format!(
                "[CIP] {} not found in {} - application is not CIP compliant",
                MANIFEST_FILE, deploy_path
            ))
            .await;
        return Err(ValidationError::ManifestMissing {
            path: deploy_path.to_string(),
        }
        .into());
    }

    // Best effort: give the host a JSON parser before falling back to
    // text scanning. Failure to install is fine, the fallback covers it.
    let tooling = runner
        .run_command(&json_tooling_command(deploy_path))
        .await?;
    router
        .forward(tooling.output.trim_end(), OutputChannel::Info)
        .await;

    let mut manifest = Manifest::default();
    for script in LifecycleScript::ALL {
        router
            .info(format!("[CIP] Checking script: {}", script))
            .await;

        let Some(path) = extract_script_path(runner, deploy_path, script).await? else {
            router
                .error(format!(
                    "[CIP] Required script '{}' is not defined in {}",
                    script, MANIFEST_FILE
                ))
                .await;
            return Err(ValidationError::MissingScript { script }.into());
        };

        let exists = runner
            .run_command(&format!("cd {} && test -f \"{}\"", deploy_path, path))
            .await?;
        if !exists.success() {
            router
                .error(format!("[CIP] Script '{}' not found at '{}'", script, path))
                .await;
            return Err(ValidationError::ScriptNotFound { script, path }.into());
        }

        let executable = runner
            .run_command(&format!("cd {} && test -x \"{}\"", deploy_path, path))
            .await?;
        if !executable.success() {
            router
                .info(format!("[CIP] Making script executable: {}", path))
                .await;
            let chmod = runner
                .run_command(&format!("cd {} && chmod +x \"{}\"", deploy_path, path))
                .await?;
            if !chmod.success() {
                // The executor chmods again right before running, so a
                // failure here is a warning, not an abort.
                tracing::warn!("chmod +x {} failed: {}", path, chmod.output.trim());
            }
        }

        router
            .info(format!("[CIP] Script '{}' found and ready at {}", script, path))
            .await;
        manifest.set_script(script, path);
    }

    router.info("[CIP] All validation checks passed").await;
    Ok(manifest)
}

/// Read and parse the remote manifest in one round trip.
///
/// Validation resolves script paths remotely and does not need this, but
/// callers inspecting a deployment (extra script entries, tooling) get the
/// whole parsed manifest here.
pub async fn fetch_manifest<R>(runner: &R, deploy_path: &str) -> Result<Manifest, EngineError>
where
    R: CommandRunner + ?Sized,
{
    let result = runner
        .run_command(&format!("cd {} && cat {}", deploy_path, MANIFEST_FILE))
        .await?;
    if !result.success() {
        return Err(ValidationError::ManifestMissing {
            path: deploy_path.to_string(),
        }
        .into());
    }
    Ok(Manifest::from_json(&result.output)?)
}

/// Resolve one script path on the remote host.
///
/// Returns `None` for absent, empty, or `null` entries. A failed
/// extraction command is treated the same way; its output has already
/// been captured for diagnostics.
async fn extract_script_path<R>(
    runner: &R,
    deploy_path: &str,
    script: LifecycleScript,
) -> Result<Option<String>, EngineError>
where
    R: CommandRunner + ?Sized,
{
    let result = runner
        .run_command(&script_extraction_command(deploy_path, script))
        .await?;
    if !result.success() {
        tracing::debug!(
            "Script path extraction for '{}' failed: {}",
            script,
            result.output.trim()
        );
        return Ok(None);
    }

    let path = result.output.trim();
    if path.is_empty() || path == "null" {
        Ok(None)
    } else {
        Ok(Some(path.to_string()))
    }
}

/// Shell snippet that installs jq if a package manager allows it.
fn json_tooling_command(deploy_path: &str) -> String {
    format!(
        r#"cd {} &&
if ! command -v jq >/dev/null 2>&1; then
    echo "jq not found, trying to install..."
    if command -v apt-get >/dev/null 2>&1; then
        sudo apt-get update && sudo apt-get install -y jq 2>/dev/null || echo "Could not install jq via apt-get"
    elif command -v yum >/dev/null 2>&1; then
        sudo yum install -y jq 2>/dev/null || echo "Could not install jq via yum"
    elif command -v apk >/dev/null 2>&1; then
        sudo apk add --no-cache jq 2>/dev/null || echo "Could not install jq via apk"
    else
        echo "Package manager not found, will use text-scan parsing"
    fi
fi
if command -v jq >/dev/null 2>&1; then
    echo "Using jq for JSON parsing"
else
    echo "Using text-scan JSON parsing (grep/sed)"
fi"#,
        deploy_path
    )
}

/// Shell snippet that prints one script path, or nothing when undefined.
fn script_extraction_command(deploy_path: &str, script: LifecycleScript) -> String {
    format!(
        r#"cd {} &&
if command -v jq >/dev/null 2>&1; then
    jq -r ".scripts.{} // empty" {} 2>/dev/null
else
    grep -A 20 '"scripts"' {} | grep "\"{}\"" | sed 's/.*: *"\([^"]*\)".*/\1/' | head -1
fi"#,
        deploy_path, script, MANIFEST_FILE, MANIFEST_FILE, script
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_command_has_jq_and_fallback() {
        let command = script_extraction_command("/opt/app", LifecycleScript::Start);
        assert!(command.starts_with("cd /opt/app &&"));
        assert!(command.contains(r#"jq -r ".scripts.start // empty" cloudbox.json"#));
        assert!(command.contains(r#"grep -A 20 '"scripts"' cloudbox.json"#));
        assert!(command.contains(r#"grep "\"start\"""#));
    }

    #[test]
    fn test_tooling_command_tries_known_package_managers() {
        let command = json_tooling_command("/opt/app");
        for manager in ["apt-get", "yum", "apk"] {
            assert!(command.contains(manager), "missing {}", manager);
        }
        assert!(command.contains("sudo apt-get install -y jq"));
    }
}
