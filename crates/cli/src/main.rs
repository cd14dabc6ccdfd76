use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Kommo / Wazzup webhook auto-reply relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default config file (left untouched if it already exists).
    Init {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (webhooks, OAuth callback and chats admin API).
    Gateway {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 3000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the reply the configured rules would send for a message.
    Reply {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Inbound message text
        text: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatrelay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Reply { config, text }) => {
            if let Err(e) = run_reply(config, &text) {
                log::error!("reply failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(relay::config::default_config_path);
    if relay::config::init_config_file(&path)? {
        println!("wrote default configuration to {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = relay::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    relay::gateway::run_gateway(config, path).await
}

fn run_reply(config_path: Option<std::path::PathBuf>, text: &str) -> anyhow::Result<()> {
    let (config, _) = relay::config::load_config(config_path)?;
    let selector = relay::reply::ReplySelector::new(&config.replies);
    println!("{}", selector.select(text));
    Ok(())
}
