use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vaultguard_client::HealthStatus;

#[derive(Debug, Parser)]
#[command(name = "vaultguard", version)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask the policy engine whether `user` holds `relation` on `object`.
    Check {
        #[arg(long)]
        user: String,
        #[arg(long)]
        relation: String,
        #[arg(long)]
        object: String,
    },
    Health,
    /// Print the effective limits of a tenant on a plan tier.
    Limits {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        plan: String,
    },
    AuditLogs {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

/// The line `vaultguard health` prints, or the failure it exits with.
pub fn health_report(status: HealthStatus) -> Result<String, String> {
    if !status.healthy {
        let reason = status.last_error.unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("unhealthy: {reason}"));
    }
    let latency = status.latency.map(|d| d.as_millis()).unwrap_or_default();
    Ok(format!("healthy ({latency} ms)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;

    #[test]
    fn healthy_status_reports_latency() {
        let status = HealthStatus {
            healthy: true,
            latency: Some(Duration::from_millis(12)),
            ..HealthStatus::default()
        };

        assert_eq!(health_report(status), Ok("healthy (12 ms)".to_string()));
    }

    #[test]
    fn unhealthy_status_is_an_error_not_an_exit() {
        let status = HealthStatus {
            healthy: false,
            last_error: Some("connection refused".to_string()),
            ..HealthStatus::default()
        };

        assert_eq!(
            health_report(status),
            Err("unhealthy: connection refused".to_string())
        );
        assert_eq!(
            health_report(HealthStatus { healthy: false, ..HealthStatus::default() }),
            Err("unhealthy: unknown error".to_string())
        );
    }

    #[test]
    fn cli_parses_check_subcommand() {
        let cli = Cli::parse_from([
            "vaultguard",
            "check",
            "--user",
            "user:alice",
            "--relation",
            "view",
            "--object",
            "vault:v1",
        ]);
        assert!(matches!(
            cli.command,
            Some(Command::Check { user, relation, object })
                if user == "user:alice" && relation == "view" && object == "vault:v1"
        ));
    }

    #[test]
    fn cli_check_requires_all_three_flags() {
        let result = Cli::try_parse_from(["vaultguard", "check", "--user", "user:alice"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_health_subcommand() {
        let cli = Cli::parse_from(["vaultguard", "health"]);
        assert!(matches!(cli.command, Some(Command::Health)));
    }

    #[test]
    fn cli_parses_limits_subcommand() {
        let cli = Cli::parse_from(["vaultguard", "limits", "--tenant", "acme", "--plan", "pro"]);
        assert!(matches!(
            cli.command,
            Some(Command::Limits { tenant, plan }) if tenant == "acme" && plan == "pro"
        ));
    }

    #[test]
    fn cli_audit_logs_defaults_to_json() {
        let cli = Cli::parse_from(["vaultguard", "audit-logs"]);
        assert!(matches!(
            cli.command,
            Some(Command::AuditLogs { user: None, action: None, format: OutputFormat::Json })
        ));
    }

    #[test]
    fn cli_audit_logs_accepts_filters_and_csv() {
        let cli = Cli::parse_from([
            "vaultguard",
            "audit-logs",
            "--user",
            "user:bob",
            "--action",
            "permission.grant",
            "--format",
            "csv",
        ]);
        assert!(matches!(
            cli.command,
            Some(Command::AuditLogs { user: Some(u), action: Some(a), format: OutputFormat::Csv })
                if u == "user:bob" && a == "permission.grant"
        ));
    }

    #[test]
    fn cli_rejects_unknown_format() {
        let result = Cli::try_parse_from(["vaultguard", "audit-logs", "--format", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_config_flag_works_after_subcommand() {
        let cli = Cli::parse_from(["vaultguard", "migrate", "--config", "/etc/vaultguard.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vaultguard.toml")));
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn cli_defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["vaultguard"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_version_flag() {
        let result = Cli::try_parse_from(["vaultguard", "--version"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
