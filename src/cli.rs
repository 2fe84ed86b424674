use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Keep a local auction database in sync and export TradeSkillMaster price
/// files from it.
#[derive(Parser, Debug)]
#[command(name = "ahdb", version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Configuration file (.toml, .yaml, .yml or .json)
    #[arg(long, short = 'c', global = true, env = "AHDB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch every snapshot the remote has and the local database lacks
    Sync,
    /// Write price files for the configured selection, or for the given scopes
    Export {
        /// Scopes as `region/realm`, e.g. `us/stormrage`
        #[arg(value_name = "REGION/REALM")]
        scopes: Vec<String>,
    },
    /// Run periodic sync, auto-export and update checks until interrupted
    Run,
    /// Check once for a newer release
    CheckUpdate,
    /// Show the snapshots held per realm
    Status,
    /// Manage the derived-data cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Manage the snapshot database
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Delete every cached entry
    Clear,
    /// Delete entries older than `cache.expires_in_secs`
    Prune,
    /// Show the number and total size of cached entries
    Stats,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbAction {
    /// Delete every snapshot
    Clear,
}

impl Cli {
    /// Default `EnvFilter` directive for the verbosity flag.
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_verify_command() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["ahdb", "status"], "info")]
    #[case(&["ahdb", "-v", "status"], "debug")]
    #[case(&["ahdb", "status", "-vv"], "trace")]
    #[case(&["ahdb", "-vvv", "sync"], "trace")]
    fn test_verbosity(#[case] args: &[&str], #[case] expected: &str) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.log_directive(), expected);
    }

    #[test]
    fn test_export_scopes() {
        let cli = Cli::try_parse_from(["ahdb", "--config", "a.toml", "export", "us/stormrage", "eu/draenor"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("a.toml")));
        match cli.command {
            Command::Export { scopes } => assert_eq!(scopes, ["us/stormrage", "eu/draenor"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[rstest]
    #[case(&["ahdb", "cache", "clear"], Some(CacheAction::Clear), None)]
    #[case(&["ahdb", "cache", "prune"], Some(CacheAction::Prune), None)]
    #[case(&["ahdb", "cache", "stats"], Some(CacheAction::Stats), None)]
    #[case(&["ahdb", "db", "clear"], None, Some(DbAction::Clear))]
    fn test_maintenance_commands(
        #[case] args: &[&str],
        #[case] cache: Option<CacheAction>,
        #[case] db: Option<DbAction>,
    ) {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Cache { action } => assert_eq!(Some(action), cache),
            Command::Db { action } => assert_eq!(Some(action), db),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["ahdb"]).is_err());
    }
}
