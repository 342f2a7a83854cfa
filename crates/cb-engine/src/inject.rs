//! Environment injection
//!
//! Writes the session environment to a script in the deployment path and
//! sources it, so lifecycle scripts and anyone shelling into the host see
//! the same CLOUDBOX_* variables. The script is rewritten on every
//! injection; stale variables from a previous deployment never survive.

use std::collections::BTreeMap;

use cb_protocol::{OutputChannel, CIP_VERSION, ENV_SCRIPT_FILE};

use crate::error::{EngineError, InjectionError};
use crate::router::OutputRouter;
use crate::transport::CommandRunner;

/// Write the environment script into the deployment path and source it.
///
/// The script body travels inside a quoted heredoc, so values pass
/// through the remote shell without expansion.
pub async fn inject_environment<R>(
    runner: &R,
    deploy_path: &str,
    environment: &BTreeMap<String, String>,
    router: &OutputRouter,
) -> Result<(), EngineError>
where
    R: CommandRunner + ?Sized,
{
    router
        .info("[CIP] Injecting CloudBox environment variables")
        .await;

    let script = render_env_script(environment);
    let write_command = format!(
        "cd {} && cat > {} << 'EOF'\n{}EOF",
        deploy_path, ENV_SCRIPT_FILE, script
    );

    let result = runner.run_command(&write_command).await?;
    if !result.success() {
        router.error("[CIP] Failed to write environment script").await;
        router.forward(&result.output, OutputChannel::Error).await;
        return Err(InjectionError::WriteFailed {
            output: result.output.trim().to_string(),
        }
        .into());
    }

    let source_command = format!(
        "cd {} && chmod +x {} && source {}",
        deploy_path, ENV_SCRIPT_FILE, ENV_SCRIPT_FILE
    );
    let result = runner.run_command(&source_command).await?;
    if !result.success() {
        router
            .error("[CIP] Failed to activate environment script")
            .await;
        router.forward(&result.output, OutputChannel::Error).await;
        return Err(InjectionError::SourceFailed {
            output: result.output.trim().to_string(),
        }
        .into());
    }

    router
        .info(format!(
            "[CIP] Environment ready: {} variables in {}",
            environment.len(),
            ENV_SCRIPT_FILE
        ))
        .await;
    Ok(())
}

/// Render the environment script content.
///
/// Keys arrive in a sorted map, so two sessions with the same deployment
/// render byte-identical scripts.
fn render_env_script(environment: &BTreeMap<String, String>) -> String {
    let mut script = format!(
        "#!/bin/bash\n# CloudBox Install Protocol environment variables\n# Auto-generated by CloudBox v{}\n\n",
        CIP_VERSION
    );
    for (key, value) in environment {
        script.push_str(&format!("export {}=\"{}\"\n", key, value));
    }
    script
}
