use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use ldapsync::config::Configuration;
use ldapsync::{Result, UserStore, database, telemetry};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration, `config.yaml` by default.
    #[arg(long, short, global = true, env = "LDAPSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Authenticate against the directory and print the synchronized user.
    Authenticate {
        username: String,
        /// Read from the first line of stdin when missing.
        #[arg(long, env = "LDAPSYNC_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Print a stored user.
    User { id: i64 },
    /// Manage local groups.
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum GroupAction {
    /// Create a local group, if missing.
    Add { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            ExitCode::from(2)
        },
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Configuration::default();
    if let Some(path) = args.config {
        config = config.path(path);
    }
    let config = config.read()?;

    match args.cmd {
        Commands::Authenticate { username, password } => {
            let password = match password {
                Some(password) => password,
                None => read_password()?,
            };

            let backend = ldapsync::initialize(config).await?;
            match backend.authenticate(&username, &password).await? {
                Some(user) => print_json(&user),
                None => {
                    eprintln!("Authentication failed for {username:?}.");
                    Ok(ExitCode::FAILURE)
                },
            }
        },
        Commands::User { id } => {
            let store = database::store(config.postgres.as_ref()).await?;
            match store.find_by_id(id).await? {
                Some(user) => print_json(&user),
                None => {
                    eprintln!("No user with id {id}.");
                    Ok(ExitCode::FAILURE)
                },
            }
        },
        Commands::Group {
            action: GroupAction::Add { name },
        } => {
            let store = database::store(config.postgres.as_ref()).await?;
            let group = store.create_group(&name).await?;
            print_json(&group)
        },
    }
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

fn print_json<T: Serialize>(value: &T) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}
