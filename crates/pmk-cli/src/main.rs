use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pmk")]
#[command(about = "PayMilestone escrow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses while any dispute is open
    /// (SUBMITTED/MEDIATION) unless --yes is provided.
    Migrate {
        /// Acknowledge you are migrating a DB that holds live arbitration
        /// state.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of an audit log file.
    Verify { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let pool = pmk_db::connect_from_env().await?;
                let st = pmk_db::status(&pool).await?;
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": st.ok,
                        "has_escrow_table": st.has_escrow_table,
                    })
                );
            }
            DbCmd::Migrate { yes } => {
                let pool = pmk_db::connect_from_env().await?;
                let open = pmk_db::count_open_disputes(&pool).await?;
                if migrate_blocked(open, yes) {
                    bail!(
                        "refusing to migrate: {open} open dispute(s) exist; \
                         re-run with --yes to acknowledge"
                    );
                }
                pmk_db::migrate(&pool).await?;
                println!("migrations applied");
            }
        },

        Commands::ConfigHash { paths } => {
            let refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = pmk_config::load_layered_yaml(&refs)?;
            println!("config_hash: {}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path } => match pmk_audit::verify_hash_chain(&path)? {
                pmk_audit::VerifyResult::Valid { lines } => {
                    println!("audit chain valid ({lines} events)");
                }
                pmk_audit::VerifyResult::Broken { line, reason } => {
                    bail!("audit chain BROKEN at line {line}: {reason}");
                }
            },
        },
    }

    Ok(())
}

/// Migration guardrail: live arbitration state blocks unacknowledged
/// migrations.
fn migrate_blocked(open_disputes: i64, yes: bool) -> bool {
    open_disputes > 0 && !yes
}

#[cfg(test)]
mod tests {
    use super::migrate_blocked;

    #[test]
    fn migrate_guardrail_requires_acknowledgment() {
        assert!(migrate_blocked(1, false));
        assert!(!migrate_blocked(1, true));
        assert!(!migrate_blocked(0, false));
        assert!(!migrate_blocked(0, true));
    }
}
