use clap::{
    ArgAction, CommandFactory, Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use clap_complete::{Shell, generate};
use log::LevelFilter;
use reqwest::Method;

use sptcli::{
    cli,
    config::{self, Config},
    error,
};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::White.on_default() | Effects::BOLD)
        .usage(AnsiColor::White.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default())
        .placeholder(AnsiColor::BrightCyan.on_default())
}

#[derive(Parser, Debug, Clone)]
#[clap(
  version = env!("CARGO_PKG_VERSION"),
  name=env!("CARGO_PKG_NAME"),
  bin_name=env!("CARGO_PKG_NAME"),
  about=env!("CARGO_PKG_DESCRIPTION"),
  styles=styles(),
)]
struct Cli {
    /// Only log warnings and errors
    #[clap(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable verbose logging; repeat for trace output
    #[clap(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log in through the browser
    Login(LoginOptions),

    /// Forget the stored credential
    Logout,

    /// Show the login status
    Status,

    /// Call a Web API endpoint and print the reply
    Request(RequestOptions),

    /// Get shell completions
    Completions(CompletionsOption),
}

#[derive(Parser, Debug, Clone)]
pub struct LoginOptions {
    /// Log in again even if a credential is stored
    #[clap(long)]
    force: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method, e.g. GET or PUT
    #[clap(value_parser = parse_method)]
    method: Method,

    /// Endpoint below the API base, e.g. me/player
    endpoint: String,

    /// Query parameter as key=value; can be repeated
    #[clap(long, value_parser = parse_query_pair, action = ArgAction::Append)]
    query: Vec<(String, String)>,

    /// JSON request body
    #[clap(long)]
    body: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct CompletionsOption {
    shell: Shell,
}

fn parse_method(s: &str) -> Result<Method, String> {
    Method::from_bytes(s.to_ascii_uppercase().as_bytes()).map_err(|e| e.to_string())
}

fn parse_query_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

fn init_logger(cli: &Cli) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
    );

    if cli.quiet || cli.verbose > 0 {
        let level = match cli.verbose {
            // quiet
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logger(&cli);

    if let Command::Completions(opt) = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(opt.shell, &mut cmd, name, &mut std::io::stdout());
        return;
    }

    if let Err(e) = config::load_env().await {
        error!("Cannot load environment. Err: {}", e);
    }
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => error!("Invalid configuration: {}", e),
    };

    let result = match cli.command {
        Command::Login(opt) => cli::login(&config, opt.force).await,
        Command::Logout => cli::logout(&config).await,
        Command::Status => cli::status(&config).await,
        Command::Request(opt) => {
            cli::request(
                &config,
                opt.method,
                &opt.endpoint,
                opt.query,
                opt.body.as_deref(),
            )
            .await
        }
        Command::Completions(_) => Ok(()),
    };

    if let Err(e) = result {
        error!("{}", e);
    }
}
