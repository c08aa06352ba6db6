use clap::{Args, Parser, Subcommand, ValueEnum};
use crate::core::model::RefreshScope;
use std::path::PathBuf;

/// mapperlink - Keeps MyBatis mapper XML and Java code linked through a persistent index
#[derive(Parser, Debug)]
#[command(name = "mapperlink")]
#[command(about = "Bidirectional index between Java code and MyBatis mapper statements", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project root (default: current directory)
    #[arg(short, long, default_value = ".")]
    pub project: PathBuf,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeArg {
    All,
    Code,
    Markup,
    Usage,
}

impl From<ScopeArg> for RefreshScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::All => RefreshScope::All,
            ScopeArg::Code => RefreshScope::Code,
            ScopeArg::Markup => RefreshScope::Markup,
            ScopeArg::Usage => RefreshScope::Usage,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the project data directory and write a default config file
    Init {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Rebuild the index (or one part of it)
    Refresh {
        #[command(flatten)]
        project: ProjectArgs,
        /// Which part of the index to rebuild
        #[arg(short, long, value_enum, default_value_t = ScopeArg::All)]
        scope: ScopeArg,
    },
    /// Reconcile the index with the files on disk
    Scan {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Watch the project and keep the index up to date
    Watch {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Show every record linked to the given logical ids
    Lookup {
        #[command(flatten)]
        project: ProjectArgs,
        /// Logical ids such as com.x.UserMapper.findById
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List the logical ids a file contributes
    Ids {
        #[command(flatten)]
        project: ProjectArgs,
        /// File path, absolute or relative to the project root
        file: PathBuf,
    },
    /// Check the index for inconsistencies
    Health {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Show table counts and the cache version
    Stats {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_refresh_scope() {
        let cli = Cli::parse_from(["mapperlink", "refresh", "--scope", "usage", "-p", "/tmp/app"]);
        match cli.command {
            Commands::Refresh { project, scope } => {
                assert_eq!(RefreshScope::from(scope), RefreshScope::Usage);
                assert_eq!(project.project, PathBuf::from("/tmp/app"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_lookup_requires_ids() {
        assert!(Cli::try_parse_from(["mapperlink", "lookup"]).is_err());
        let cli = Cli::try_parse_from(["mapperlink", "lookup", "a.b", "c.d"]).unwrap();
        assert!(matches!(cli.command, Commands::Lookup { ref ids, .. } if ids.len() == 2));
    }
}
