use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use uimonkey::config::{self, CONTROLLER_ADDR_ENV};
use uimonkey::controller::{ControllerEventKind, ControllerListener};
use uimonkey::MonkeyResult;

#[derive(Parser, Debug)]
#[command(name = "uimonkey-controller", about = "Record and replay UI actions through a uimonkey agent", version)]
struct Cli {
    /// Address to listen on. Defaults to the configured controller address.
    #[arg(long)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every user action as a script line until the agent disconnects.
    Record,
    /// Replay a script file and report how it went.
    Run {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    uimonkey::init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "controller failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> MonkeyResult<ExitCode> {
    let address = match cli.listen {
        Some(address) => address,
        None => config::load_config()?.controller.address,
    };
    let listener = ControllerListener::bind(address.as_str()).await?;
    eprintln!(
        "waiting for agent; start the target with {CONTROLLER_ADDR_ENV}={}",
        listener.local_addr()?
    );
    let mut session = listener.accept().await?;

    match cli.command {
        Command::Record => {
            while let Some(event) = session.next_event().await? {
                match event.kind {
                    ControllerEventKind::UserEvent(statement) => println!("{statement}"),
                    other => tracing::debug!(event = ?other, "ignored while recording"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { file } => {
            let body = tokio::fs::read_to_string(&file).await?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            session.run_script(&name, &body).await?;
            let transcript = session.wait_script_end().await?;

            for line in &transcript.logs {
                eprintln!("log: {line}");
            }
            for statement in &transcript.user_events {
                println!("{statement}");
            }
            match transcript.error {
                Some(message) => {
                    eprintln!("script {name} failed: {message}");
                    Ok(ExitCode::FAILURE)
                }
                None => {
                    eprintln!("script {name} passed");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
    }
}
