use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use wayfarer_agents::{
    AgentConfig, BookingAgent, IdentityProvider, ModelResponse, ModelStop, ScriptedModel,
    SessionGate, StreamComposer, SyntheticInventory, TurnInput, TurnOutcome,
};
use wayfarer_api::{ModelBackend, SessionDirectory};
use wayfarer_core::{ConsentDecision, ConversationMessage, StreamEvent, StreamEventKind, ToolCallRequest, ToolCatalog};
use wayfarer_observability::{init_tracing, AppMetrics, TracingEventSink};
use wayfarer_storage::Store;

type CliAgent = BookingAgent<ModelBackend, SyntheticInventory, Store>;

#[derive(Debug, Parser)]
#[command(name = "wayfarer")]
#[command(about = "Wayfarer travel booking assistant CLI")]
struct Cli {
    /// Session token used to resolve the signed-in user.
    #[arg(long, env = "WAYFARER_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the tool definitions handed to the language model.
    Tools,
    /// Replay a scripted conversation from a JSON file.
    Script { path: PathBuf },
    /// Interactive chat against the configured language model.
    Chat {
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    replies: Vec<ScriptReply>,
    turns: Vec<ScriptTurn>,
}

#[derive(Debug, Deserialize)]
struct ScriptReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Deserialize)]
struct ScriptTurn {
    user: String,
    #[serde(default)]
    consent: Option<ScriptConsent>,
}

#[derive(Debug, Deserialize)]
struct ScriptConsent {
    offer_id: String,
    approved: bool,
}

impl From<ScriptReply> for ModelResponse {
    fn from(reply: ScriptReply) -> Self {
        let stop = if reply.tool_calls.is_empty() {
            ModelStop::Stop
        } else {
            ModelStop::ToolCalls
        };
        ModelResponse {
            text: reply.text,
            tool_calls: reply.tool_calls,
            stop,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("wayfarer_cli");
    let cli = Cli::parse();
    let identities = Arc::new(SessionDirectory::from_env());

    match cli.command {
        Command::Tools => {
            let definitions = ToolCatalog::standard().definitions();
            println!("{}", serde_json::to_string_pretty(&definitions)?);
        }
        Command::Script { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading script {}", path.display()))?;
            let script: ScriptFile = serde_json::from_str(&raw)
                .with_context(|| format!("invalid script {}", path.display()))?;
            let model = ScriptedModel::replies(script.replies.into_iter().map(Into::into).collect());
            let agent = build_agent(ModelBackend::Scripted(Arc::new(model))).await?;
            run_script(&agent, &identities, cli.token, script.session_id, script.turns).await?;
        }
        Command::Chat { session } => {
            let agent = build_agent(ModelBackend::from_env()?).await?;
            run_chat(&agent, &identities, cli.token, session).await?;
        }
    }

    Ok(())
}

async fn build_agent(model: ModelBackend) -> Result<CliAgent> {
    let store = if let Ok(database_url) = env::var("WAYFARER_DATABASE_URL") {
        Store::sqlite(&database_url).await?
    } else {
        Store::memory()
    };

    Ok(BookingAgent::new(
        Arc::new(model),
        Arc::new(SyntheticInventory::new()),
        Arc::new(store),
        Arc::new(TracingEventSink),
        AppMetrics::shared(),
        AgentConfig::from_env(),
    ))
}

fn gate(identities: &Arc<SessionDirectory>, token: &Option<String>) -> SessionGate {
    match token {
        Some(token) => {
            let provider: Arc<dyn IdentityProvider> = identities.clone();
            SessionGate::new(provider, vec![token.clone()])
        }
        None => SessionGate::anonymous(),
    }
}

/// Runs one turn while the events are printed as they arrive.
async fn turn(
    agent: &CliAgent,
    input: TurnInput,
    mut print: impl FnMut(&StreamEvent),
) -> Result<TurnOutcome> {
    let (sender, mut receiver) = mpsc::channel(64);
    let mut composer = StreamComposer::new(sender);

    let run = async {
        let outcome = agent.run_turn(input, &mut composer).await;
        drop(composer);
        outcome
    };
    let drain = async {
        while let Some(event) = receiver.recv().await {
            print(&event);
        }
    };

    let (outcome, ()) = tokio::join!(run, drain);
    outcome
}

async fn run_script(
    agent: &CliAgent,
    identities: &Arc<SessionDirectory>,
    token: Option<String>,
    session_id: Option<String>,
    turns: Vec<ScriptTurn>,
) -> Result<()> {
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    for script_turn in turns {
        let input = TurnInput {
            session_id: session_id.clone(),
            messages: vec![ConversationMessage::user(script_turn.user)],
            gate: gate(identities, &token),
        };
        turn(agent, input, |event| match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(error) => eprintln!("unprintable event {}: {error}", event.seq),
        })
        .await?;

        if let Some(consent) = script_turn.consent {
            let authorization = agent
                .apply_consent(
                    &session_id,
                    &consent.offer_id,
                    ConsentDecision::from(consent.approved),
                    &gate(identities, &token),
                )
                .await
                .with_context(|| format!("consent for {} was rejected", consent.offer_id))?;
            println!("{}", serde_json::to_string(&authorization)?);
        }
    }

    let workflow = agent
        .workflow_for(&session_id, &gate(identities, &token))
        .await
        .with_context(|| format!("workflow of session {session_id} is not visible"))?;
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    Ok(())
}

async fn run_chat(
    agent: &CliAgent,
    identities: &Arc<SessionDirectory>,
    token: Option<String>,
    session: Option<String>,
) -> Result<()> {
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    println!("Wayfarer chat, session {session_id}.");
    println!("Commands: /approve <offer>, /decline <offer>, /workflow, exit");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let message = line.trim();
        if message.eq_ignore_ascii_case("exit") || message.eq_ignore_ascii_case("quit") {
            break;
        }
        if message.is_empty() {
            continue;
        }

        if let Some(command) = message.strip_prefix('/') {
            handle_command(agent, identities, &token, &session_id, command).await?;
            continue;
        }

        let input = TurnInput {
            session_id: session_id.clone(),
            messages: vec![ConversationMessage::user(message)],
            gate: gate(identities, &token),
        };
        match turn(agent, input, print_event).await {
            Ok(_) => println!(),
            Err(error) => eprintln!("turn failed: {error:#}"),
        }
    }

    Ok(())
}

async fn handle_command(
    agent: &CliAgent,
    identities: &Arc<SessionDirectory>,
    token: &Option<String>,
    session_id: &str,
    command: &str,
) -> Result<()> {
    let mut parts = command.split_whitespace();
    let decision = match parts.next() {
        Some("approve") => ConsentDecision::Approved,
        Some("decline") => ConsentDecision::Declined,
        Some("workflow") => {
            match agent.workflow_for(session_id, &gate(identities, token)).await {
                Ok(workflow) => println!("{}", serde_json::to_string_pretty(&workflow)?),
                Err(error) => println!("workflow unavailable: {error}"),
            }
            return Ok(());
        }
        _ => {
            println!("unknown command /{command}");
            return Ok(());
        }
    };

    let Some(offer_id) = parts.next() else {
        println!("usage: /approve <offer> or /decline <offer>");
        return Ok(());
    };
    match agent
        .apply_consent(session_id, offer_id, decision, &gate(identities, token))
        .await
    {
        Ok(authorization) => println!("payment {:?} for {}", authorization.status, offer_id),
        Err(error) => println!("consent rejected: {error}"),
    }
    Ok(())
}

fn print_event(event: &StreamEvent) {
    match &event.kind {
        StreamEventKind::TextDelta { text } => print!("{text}"),
        StreamEventKind::ToolCall { call } => println!("\n[{}] {}", call.name, call.arguments),
        StreamEventKind::ToolResult { invocation } => {
            println!("[{}] {}", invocation.tool_name, invocation.result_payload())
        }
        StreamEventKind::Error { message } => eprintln!("\nerror: {message}"),
        StreamEventKind::Finish { reason } => println!("\n({reason:?})"),
    }
    let _ = io::stdout().flush();
}
