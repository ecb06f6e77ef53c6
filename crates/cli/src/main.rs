mod agent;
mod config;
mod dialogue;
mod render;

use agent::{Agent, Outcome};
use anyhow::Result;
use clap::{Parser, Subcommand};
use dialogue::{Answerer, DefaultsAnswerer, TerminalAnswerer};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "opsdesk", about = "opsdesk CLI - ask the ERP agent from the terminal")]
struct Cli {
    /// Config file (default: $OPSDESK_CONFIG or ~/.config/opsdesk/opsdesk.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and stream the answer
    Ask {
        query: String,

        /// Model to run
        #[arg(long)]
        model: Option<String>,

        /// Maximum agent turns for this run
        #[arg(long)]
        max_turns: Option<u32>,

        /// Send the query without clarifying it first
        #[arg(long)]
        no_clarify: bool,

        /// Take defaults instead of prompting
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Interactive conversation
    Chat {
        /// Send queries without clarifying them first
        #[arg(long)]
        no_clarify: bool,
    },

    /// Resolve clarifications for a query and print the prompt that would be sent
    Clarify {
        query: String,

        /// Take defaults instead of prompting
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show or set configuration
    Config {
        /// Set the server URL
        #[arg(long)]
        server: Option<String>,

        /// Set the bearer token
        #[arg(long)]
        token: Option<String>,

        /// Set the default model
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("opsdesk=info"))
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Ask {
            query,
            model,
            max_turns,
            no_clarify,
            yes,
        } => run_ask(config_path, &query, model, max_turns, no_clarify, yes).await,
        Commands::Chat { no_clarify } => run_chat(config_path, no_clarify).await,
        Commands::Clarify { query, yes } => run_clarify(config_path, &query, yes).await,
        Commands::Config {
            server,
            token,
            model,
        } => {
            if server.is_none() && token.is_none() && model.is_none() {
                config::show_config(config_path)
            } else {
                config::set_config(config_path, server, token, model)
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn answerer(yes: bool) -> Box<dyn Answerer> {
    if yes {
        Box::new(DefaultsAnswerer)
    } else {
        Box::new(TerminalAnswerer)
    }
}

async fn run_ask(
    config_path: Option<&Path>,
    query: &str,
    model: Option<String>,
    max_turns: Option<u32>,
    no_clarify: bool,
    yes: bool,
) -> Result<()> {
    let mut agent = Agent::from_config(config::load_config(config_path)?)?;
    if let Some(model) = model {
        agent.config_mut().stream.model = model;
    }
    if let Some(max_turns) = max_turns {
        agent.config_mut().stream.max_turns = max_turns;
    }

    let mut prompter = answerer(yes);
    let answerer: Option<&mut dyn Answerer> = if no_clarify {
        None
    } else {
        Some(prompter.as_mut())
    };
    match agent.ask(query, answerer).await? {
        Outcome::Answered(_) => Ok(()),
        Outcome::Failed(message) => anyhow::bail!("run failed: {message}"),
        Outcome::Cancelled => {
            println!("(cancelled)");
            Ok(())
        }
    }
}

async fn run_clarify(config_path: Option<&Path>, query: &str, yes: bool) -> Result<()> {
    let mut agent = Agent::from_config(config::load_config(config_path)?)?;
    let mut prompter = answerer(yes);
    let prompt = agent.clarify(query, prompter.as_mut()).await?;
    println!("{prompt}");
    Ok(())
}

const CHAT_HELP: &str = "Commands: /new  /history  /toggle N  /quit";

async fn run_chat(config_path: Option<&Path>, no_clarify: bool) -> Result<()> {
    let mut agent = Agent::from_config(config::load_config(config_path)?)?;
    let mut terminal = TerminalAnswerer;
    println!("{CHAT_HELP}");

    loop {
        let line = match dialoguer::Input::<String>::new()
            .with_prompt("you")
            .allow_empty(true)
            .interact_text()
        {
            Ok(line) => line,
            // stdin closed
            Err(_) => break,
        };
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
            ("", _) => continue,
            ("/quit" | "/exit", _) => break,
            ("/help", _) => println!("{CHAT_HELP}"),
            ("/new", _) => {
                agent.new_conversation();
                println!("Started a new conversation.");
            }
            ("/history", _) => {
                let history = agent.history();
                if history.is_empty() {
                    println!("(no turns yet)");
                } else {
                    println!("{history}");
                }
            }
            ("/toggle", arg) => match arg.parse::<usize>().ok().and_then(|n| agent.toggle(n)) {
                Some(_) => println!("{}", agent.history()),
                None => println!("No turn `{arg}`; see /history."),
            },
            (cmd, _) if cmd.starts_with('/') => println!("Unknown command. {CHAT_HELP}"),
            _ => {
                let answerer: Option<&mut dyn Answerer> = if no_clarify {
                    None
                } else {
                    Some(&mut terminal)
                };
                match agent.ask(line, answerer).await {
                    Ok(Outcome::Answered(_)) => {}
                    Ok(Outcome::Failed(message)) => eprintln!("Run failed: {message}"),
                    Ok(Outcome::Cancelled) => println!("(cancelled)"),
                    Err(e) => eprintln!("Error: {:#}", e),
                }
                println!();
            }
        }
    }
    Ok(())
}
