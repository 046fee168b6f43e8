use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_backends::{script_backend_from_config, text_backend_from_config};
use trellis_core::config::AppConfig;
use trellis_core::definition::AgentDefinition;
use trellis_core::traits::AgentRepository;
use trellis_core::value::VarMap;
use trellis_engine::{AtomicExecutor, ChatBroker, Interpreter};
use trellis_gateway::GatewayServer;
use trellis_store::{FileAgentRepository, FileRunStorage};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Hierarchical agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent by name and print the run record
    Run {
        /// Agent name
        agent: String,
        /// Input payload as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// List agents known to the repository
    List,
    /// Validate an agent document without running it
    Validate {
        /// Path to a YAML agent document
        file: PathBuf,
    },
    /// Start the HTTP gateway
    Serve,
}

struct Stack {
    repository: Arc<FileAgentRepository>,
    interpreter: Arc<Interpreter>,
    chat: Arc<ChatBroker>,
}

fn build_stack(config: &AppConfig) -> Stack {
    let repository = Arc::new(FileAgentRepository::new(&config.storage.agents_dir));
    let storage = Arc::new(FileRunStorage::new(&config.storage.runs_dir));
    let chat = Arc::new(ChatBroker::new());

    let executor = AtomicExecutor::new(
        text_backend_from_config(&config.backend),
        script_backend_from_config(&config.script),
    )
    .with_chat(
        chat.clone(),
        Duration::from_secs(config.engine.answer_timeout_secs),
    );

    let interpreter = Arc::new(Interpreter::new(
        repository.clone(),
        executor,
        storage,
        config.engine.clone(),
    ));

    Stack {
        repository,
        interpreter,
        chat,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trellis=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run { agent, input } => {
            let payload: VarMap = serde_json::from_str(&input)
                .map_err(|e| anyhow::anyhow!("--input must be a JSON object: {e}"))?;
            let stack = build_stack(&config);
            let record = stack.interpreter.run(&agent, payload).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status == trellis_core::record::RunStatus::Error {
                std::process::exit(1);
            }
        }
        Commands::List => {
            let stack = build_stack(&config);
            for def in stack.repository.list()? {
                let kind = if def.is_atomic() { "atomic" } else { "composite" };
                println!("{:<30} {}", def.name, kind);
            }
        }
        Commands::Validate { file } => {
            let text = std::fs::read_to_string(&file)?;
            let mut def: AgentDefinition = serde_yaml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("{}: {e}", file.display()))?;
            def.normalize()?;
            println!("ok: {} ({} inputs, {} outputs)", def.name, def.inputs.len(), def.outputs.len());
        }
        Commands::Serve => {
            let stack = build_stack(&config);
            info!(bind = %config.gateway.bind, "starting gateway");
            let server = GatewayServer::new(
                config.gateway.clone(),
                stack.repository,
                stack.interpreter,
                stack.chat,
            );
            server.run().await?;
        }
    }

    Ok(())
}
