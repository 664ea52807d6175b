use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use coachstream_conversation::{
    ConversationAgent, ConversationMode, ConversationSnapshot, ConversationStore, SendRequest,
};
use coachstream_http::{CoachApiClient, HttpError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod console;
mod settings;

use console::{Command, ConsoleOutput, TranscriptRenderer};
use settings::{Settings, SettingsError};

#[derive(Debug, Parser)]
#[command(name = "coachstream")]
#[command(about = "Chat with your coach from the terminal")]
#[command(version)]
struct Args {
    /// Settings file (defaults to <config dir>/coachstream/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Conversation to join, overriding the settings file
    #[arg(long)]
    conversation: Option<String>,

    /// Conversation mode: chat or build
    #[arg(long)]
    mode: Option<String>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("invalid settings on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to create coach API client on `{stage}`: {source}"))]
    Client {
        stage: &'static str,
        source: HttpError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "coachstream stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let config_path = args.config.unwrap_or_else(Settings::default_config_path);
    let mut settings = Settings::load(&config_path).context(SettingsSnafu {
        stage: "load-settings",
    })?;
    if let Some(conversation) = args.conversation {
        settings.conversation_id = conversation;
    }
    if let Some(mode) = args.mode {
        settings.mode = ConversationMode::parse(&mode);
    }
    let settings = settings.normalized();
    settings.validate().context(SettingsSnafu {
        stage: "validate-settings",
    })?;

    let client = Arc::new(CoachApiClient::new(settings.to_api_config()).context(ClientSnafu {
        stage: "build-client",
    })?);
    let store = Arc::new(ConversationStore::new(settings.conversation()));
    let agent = Arc::new(
        ConversationAgent::new(
            store.clone(),
            settings.participants(),
            client.clone(),
            client.clone(),
        )
        .with_term_lookup(client),
    );

    let renderer = tokio::spawn(render_transcript(store.subscribe()));
    tracing::info!(
        conversation_id = %settings.conversation_id,
        mode = settings.mode.as_str(),
        "conversation ready"
    );
    println!("Type a message. Commands: /stop, /explain <term>, /close, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-prompt",
    })? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Stop => {
                if !agent.cancel_send() {
                    println!("  nothing to stop");
                }
            }
            Command::Close => agent.close_explanation(),
            Command::Explain(term) => {
                let agent = agent.clone();
                tokio::spawn(async move {
                    // Failures are already shown through the lookup panel.
                    if let Err(error) = agent.explain_term(&term).await {
                        tracing::debug!(error = %error, "term lookup ended with an error");
                    }
                });
            }
            Command::Send(text) => {
                let agent = agent.clone();
                tokio::spawn(async move {
                    match agent.send_message(SendRequest::new(text)).await {
                        Ok(outcome) => tracing::debug!(?outcome, "send settled"),
                        Err(error) if error.is_busy() => {
                            println!("  the coach is still answering; /stop to cancel");
                        }
                        Err(error) => tracing::warn!(error = %error, "send failed"),
                    }
                });
            }
        }
    }

    agent.cancel_send();
    agent.close_explanation();
    renderer.abort();
    Ok(())
}

async fn render_transcript(mut snapshots: watch::Receiver<Arc<ConversationSnapshot>>) {
    let initial = snapshots.borrow_and_update().clone();
    let mut renderer = TranscriptRenderer::new(&initial);

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        let mut text = String::new();
        for item in renderer.render(&snapshot) {
            match item {
                ConsoleOutput::Inline(fragment) => text.push_str(&fragment),
                ConsoleOutput::Line(line) => {
                    text.push_str(&line);
                    text.push('\n');
                }
            }
        }
        if text.is_empty() {
            continue;
        }

        let mut stdout = std::io::stdout().lock();
        if stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()).is_err() {
            return;
        }
    }
}
