//! CLI command definitions (§6 "CLI to operator").
//!
//! Contract: `add, projects list, loops list|show|sync|create|delete, run,
//! serve, doctor, guardrails, mcp`. Exit codes: 0 success, 1 user-visible
//! failure, 2 usage error (clap's own default for parse failures).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

/// RalphX - iterative LLM loop orchestrator
#[derive(Parser)]
#[command(name = "ralphx", about = "Iterative LLM loop orchestrator driving subprocess CLI agents over a claimable work-item queue", version)]
pub struct Cli {
    /// Project root directory (contains or will contain `.ralphx/`)
    #[arg(short, long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a work item directly to the queue (manual input, not generator output)
    Add {
        /// Item body
        content: String,

        /// Item type label (defaults to "item")
        #[arg(long, default_value = "item")]
        item_type: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        priority: Option<i64>,

        #[arg(long)]
        category: Option<String>,

        /// Repeatable: --tag a --tag b
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Repeatable: --dep <item-id>
        #[arg(long = "dep")]
        dependencies: Vec<String>,
    },

    /// Operator-facing project catalog (external collaborator surface; §1 Non-goals excludes project creation)
    Projects {
        #[command(subcommand)]
        command: ProjectsCommand,
    },

    /// Loop configuration management
    Loops {
        #[command(subcommand)]
        command: LoopsCommand,
    },

    /// Run a loop to completion (bounded by its configured limits or ctrl-c)
    Run {
        /// Loop name (must have a matching `.ralphx/loops/<name>.yaml`)
        loop_name: String,

        /// Override the credential account id (defaults to the project scope)
        #[arg(long)]
        account: Option<String>,
    },

    /// Start the HTTP collaborator API (out of scope for this core; §1)
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Stale-run detection and cleanup
    Doctor {
        #[command(subcommand)]
        command: DoctorCommand,
    },

    /// Guardrail resources (a constrained subtype of the Resource Manager's resources)
    Guardrails {
        #[command(subcommand)]
        command: GuardrailsCommand,
    },

    /// Start the MCP server surface (out of scope for this core; §1)
    Mcp,
}

#[derive(Debug, Subcommand)]
pub enum ProjectsCommand {
    /// List projects registered in the local catalog (`~/.ralphx/projects.json`)
    List {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Subcommand)]
pub enum LoopsCommand {
    /// List loop configs under `<project>/.ralphx/loops/`
    List {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one loop's full configuration
    Show { name: String },

    /// Reload every loop config and report validation errors (cycles, unknown sources, bad weights)
    Sync,

    /// Write a new loop config to disk
    Create {
        name: String,

        #[arg(value_enum, long, default_value = "consumer")]
        r#type: LoopTypeArg,

        /// Source loop name (required for consumer loops)
        #[arg(long)]
        source: Option<String>,
    },

    /// Delete a loop config from disk
    Delete { name: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LoopTypeArg {
    Generator,
    Consumer,
}

impl From<LoopTypeArg> for crate::domain::LoopType {
    fn from(value: LoopTypeArg) -> Self {
        match value {
            LoopTypeArg::Generator => crate::domain::LoopType::Generator,
            LoopTypeArg::Consumer => crate::domain::LoopType::Consumer,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum DoctorCommand {
    /// Report stale runs without modifying them
    Scan,

    /// Mark stale runs aborted
    Cleanup,

    /// Check that required external tools are present (the `claude` CLI, `~/.claude/projects` writability)
    Check,
}

#[derive(Debug, Subcommand)]
pub enum GuardrailsCommand {
    /// List guardrail resources
    List,

    /// Print one guardrail's content
    Show { name: String },

    /// Sync `<project>/.ralphx/resources/custom/` against the store
    Sync,
}

/// Output format for list-style commands.
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {s}. Use: text or json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn output_format_parses_known_values() {
        assert!(matches!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json));
        assert!(matches!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text));
        assert!("bogus".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn add_requires_content_argument() {
        let result = Cli::try_parse_from(["ralphx", "add"]);
        assert!(result.is_err());
    }

    #[test]
    fn run_parses_loop_name() {
        let cli = Cli::try_parse_from(["ralphx", "run", "stories"]).unwrap();
        assert!(matches!(cli.command, Command::Run { loop_name, .. } if loop_name == "stories"));
    }
}
