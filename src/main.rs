use anyhow::Result;
use clap::{Parser, Subcommand};
use librarian::commands::{
    BuildRequest, ask, build_database, key_clear, key_set, key_show, list_databases, show_status,
};
use librarian::config::{run_interactive_config, show_config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "librarian")]
#[command(about = "Build searchable document databases and answer questions from them")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the embedding service, answer models and pipeline defaults
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Build a named database from a directory of documents
    Build {
        /// Name of the database to create
        name: String,
        /// Directory or single file of .pdf, .txt or .md documents
        source: PathBuf,
        /// Scan subdirectories of the source directory
        #[arg(long, short)]
        recursive: bool,
        /// TOML or JSON file with build option overrides
        #[arg(long, value_name = "FILE")]
        options: Option<PathBuf>,
        /// Override one build option, e.g. `--set min_tokens=300` or `--set paths.txt_dir=text`
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Ask a question of a database
    Ask {
        /// Database to query
        database: String,
        /// The question
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// List databases ready for querying
    List,
    /// Show component availability and database status
    Status,
    /// Manage the OpenAI API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store an API key, prompting for it when omitted
    Set {
        key: Option<String>,
    },
    /// Remove the stored API key
    Clear,
    /// Show the active API key, masked
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("librarian=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                run_interactive_config()?;
            }
        }
        Commands::Build {
            name,
            source,
            recursive,
            options,
            set,
        } => {
            build_database(&BuildRequest {
                name,
                source,
                recursive,
                options_file: options,
                assignments: set,
            })
            .await?;
        }
        Commands::Ask { database, query } => {
            ask(database, query.join(" ")).await?;
        }
        Commands::List => {
            list_databases()?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Key { action } => match action {
            KeyAction::Set { key } => key_set(key)?,
            KeyAction::Clear => key_clear()?,
            KeyAction::Show => key_show()?,
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["librarian", "list"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::List));
        }
    }

    #[test]
    fn build_command_with_overrides() {
        let cli = Cli::try_parse_from([
            "librarian",
            "build",
            "papers",
            "./pdfs",
            "--recursive",
            "--set",
            "min_tokens=300",
            "--set",
            "organize=move",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Build {
                name,
                source,
                recursive,
                options,
                set,
            } = parsed.command
            {
                assert_eq!(name, "papers");
                assert_eq!(source, PathBuf::from("./pdfs"));
                assert!(recursive);
                assert_eq!(options, None);
                assert_eq!(set, vec!["min_tokens=300", "organize=move"]);
            } else {
                panic!("expected build command");
            }
        }
    }

    #[test]
    fn build_command_requires_source() {
        let cli = Cli::try_parse_from(["librarian", "build", "papers"]);
        assert!(cli.is_err());
    }

    #[test]
    fn ask_joins_query_words() {
        let cli = Cli::try_parse_from(["librarian", "ask", "papers", "what", "is", "x?"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ask { database, query } = parsed.command {
                assert_eq!(database, "papers");
                assert_eq!(query.join(" "), "what is x?");
            } else {
                panic!("expected ask command");
            }
        }
    }

    #[test]
    fn ask_requires_query() {
        let cli = Cli::try_parse_from(["librarian", "ask", "papers"]);
        assert!(cli.is_err());
    }

    #[test]
    fn key_set_without_value_prompts() {
        let cli = Cli::try_parse_from(["librarian", "key", "set"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(
                parsed.command,
                Commands::Key {
                    action: KeyAction::Set { key: None }
                }
            ));
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["librarian", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["librarian", "serve"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["librarian", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
