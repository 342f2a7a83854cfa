//! Remote port availability probing
//!
//! Deployments declare the ports they bind. Before `start` runs, the
//! engine probes each one and warns when something is already listening,
//! Docker containers included. Probing is advisory: an inconclusive or
//! failed probe never blocks a deployment.

use std::collections::BTreeMap;

use crate::transport::CommandRunner;

/// Verdict for one probed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    /// Something is already listening
    InUse,
    /// A bind test succeeded
    Available,
    /// No probe method produced a verdict
    Unknown,
}

impl PortStatus {
    /// Whether a deployment may proceed on this port.
    ///
    /// Unknown counts as usable: an inconclusive probe must not block a
    /// deployment that would have worked.
    pub fn usable(&self) -> bool {
        !matches!(self, PortStatus::InUse)
    }
}

/// Probe each port on the host, one auxiliary command per port.
pub async fn check_port_availability<R>(runner: &R, ports: &[u16]) -> BTreeMap<u16, PortStatus>
where
    R: CommandRunner + ?Sized,
{
    let mut results = BTreeMap::new();
    for &port in ports {
        let status = match runner.run_command(&probe_command(port)).await {
            Ok(result) => parse_probe_output(&result.output),
            Err(e) => {
                tracing::warn!("Port {} probe failed: {}", port, e);
                PortStatus::Unknown
            }
        };
        results.insert(port, status);
    }
    results
}

/// Shell snippet probing one port.
///
/// Listener tables (netstat and ss) and Docker port mappings detect
/// current users of the port; a short netcat bind test confirms
/// availability when nothing was found.
fn probe_command(port: u16) -> String {
    format!(
        r#"PORT={port}
NETSTAT_CHECK=$(netstat -tuln 2>/dev/null | grep ":$PORT " | wc -l)
SS_CHECK=$(ss -tuln 2>/dev/null | grep ":$PORT " | wc -l)
DOCKER_CHECK=0
if command -v docker >/dev/null 2>&1; then
    DOCKER_CHECK=$(docker ps --format "table {{{{.Ports}}}}" 2>/dev/null | grep -c ":$PORT->" || echo 0)
fi
BIND_TEST=0
if command -v nc >/dev/null 2>&1; then
    timeout 1 nc -l $PORT 2>/dev/null &
    NC_PID=$!
    sleep 0.1
    if kill -0 $NC_PID 2>/dev/null; then
        kill $NC_PID 2>/dev/null
        BIND_TEST=1
    fi
fi
TOTAL_USAGE=$((NETSTAT_CHECK + SS_CHECK + DOCKER_CHECK))
if [ $TOTAL_USAGE -gt 0 ]; then
    echo "PORT_IN_USE:$TOTAL_USAGE"
elif [ $BIND_TEST -eq 1 ]; then
    echo "PORT_AVAILABLE:BIND_OK"
else
    echo "PORT_UNKNOWN:NO_BIND_TEST"
fi"#,
        port = port
    )
}

/// Scan probe output for the verdict marker.
fn parse_probe_output(output: &str) -> PortStatus {
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("PORT_IN_USE:") {
            return PortStatus::InUse;
        }
        if line.starts_with("PORT_AVAILABLE:") {
            return PortStatus::Available;
        }
        if line.starts_with("PORT_UNKNOWN:") {
            return PortStatus::Unknown;
        }
    }
    PortStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_map_to_statuses() {
        assert_eq!(parse_probe_output("PORT_IN_USE:2"), PortStatus::InUse);
        assert_eq!(
            parse_probe_output("PORT_AVAILABLE:BIND_OK"),
            PortStatus::Available
        );
        assert_eq!(
            parse_probe_output("PORT_UNKNOWN:NO_BIND_TEST"),
            PortStatus::Unknown
        );
    }

    #[test]
    fn test_marker_found_behind_noise() {
        let output = "nc: warning, something\nPORT_IN_USE:1\n";
        assert_eq!(parse_probe_output(output), PortStatus::InUse);
    }

    #[test]
    fn test_garbage_output_is_unknown() {
        assert_eq!(parse_probe_output("command not found"), PortStatus::Unknown);
        assert_eq!(parse_probe_output(""), PortStatus::Unknown);
    }

    #[test]
    fn test_unknown_and_available_are_usable() {
        assert!(PortStatus::Available.usable());
        assert!(PortStatus::Unknown.usable());
        assert!(!PortStatus::InUse.usable());
    }

    #[test]
    fn test_probe_command_covers_all_methods() {
        let command = probe_command(3000);
        assert!(command.starts_with("PORT=3000"));
        for needle in ["netstat -tuln", "ss -tuln", "docker ps", "nc -l $PORT"] {
            assert!(command.contains(needle), "missing {}", needle);
        }
        // Docker's template braces must survive formatting
        assert!(command.contains("{{.Ports}}"));
    }
}
