//! Trellis CLI: serve the engine, or drive a run against a server.
//!
//! Subcommands: `serve` (start the control plane), `run` (create a run and
//! node, post a message, tail events until idle), `events` (tail an
//! existing run).

use clap::{Parser, Subcommand};
use cli::Client;
use run_event::Event;
use trellis::{Engine, EngineSettings};

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(about = "Trellis — graph orchestration for agentic coding sessions")]
struct Args {
    #[command(subcommand)]
    cmd: Command,

    /// Control-plane URL for client commands (or TRELLIS_URL)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Output raw event JSON, one line per event
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the engine and control plane
    Serve {
        /// Listen address (default 127.0.0.1:4517)
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },
    /// Create a run with one node, post a message, tail until idle
    Run {
        /// The user message
        message: String,
        /// Role template for the node
        #[arg(long, default_value = "implementer")]
        role: String,
        /// Provider name (mock, api:<url>, or a command line)
        #[arg(long, default_value = "mock")]
        provider: String,
        /// Working folder for the run
        #[arg(short, long, value_name = "DIR")]
        cwd: Option<String>,
    },
    /// Tail an existing run's events
    Events {
        /// Run id
        run_id: String,
    },
}

fn resolve_url(args: &Args) -> String {
    args.url
        .clone()
        .or_else(|| std::env::var("TRELLIS_URL").ok())
        .unwrap_or_else(|| format!("http://{}", serve::DEFAULT_ADDR))
}

fn print_event(envelope: &run_event::EventEnvelope, json: bool) {
    if json {
        if let Ok(line) = envelope.to_json_line() {
            println!("{}", line);
        }
        return;
    }
    match &envelope.event {
        Event::AssistantDelta { delta, .. } => print!("{}", delta),
        Event::AssistantFinal { .. } => println!(),
        Event::NodeProgress {
            status, summary, ..
        } => {
            eprintln!(
                "[{:?}] {}",
                status,
                summary.as_deref().unwrap_or_default()
            );
        }
        Event::RunStalled { evidence } => {
            eprintln!("run stalled: {:?} on node {}", evidence.kind, evidence.node_id);
        }
        Event::ToolStarted { name, .. } => eprintln!("tool: {}", name),
        Event::ToolCompleted { name, ok, .. } => eprintln!("tool {}: ok={}", name, ok),
        _ => {}
    }
}

async fn cmd_run(
    url: String,
    json: bool,
    message: String,
    role: String,
    provider: String,
    cwd: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(url);
    let run = client.create_run(cwd.as_deref()).await?;
    let node = client
        .create_node(&run.id, "node-1", &role, &provider)
        .await?;
    client.post_message(&run.id, &node.id, &message).await?;
    eprintln!("run {} · node {}", run.id, node.id);

    let node_id = node.id.clone();
    let mut turn_seen = false;
    client
        .tail_events(&run.id, |envelope| {
            print_event(&envelope, json);
            match &envelope.event {
                Event::NodeProgress { node_id: id, status, .. } if *id == node_id => {
                    match status {
                        run_event::NodeStatus::Running => {
                            turn_seen = true;
                            true
                        }
                        run_event::NodeStatus::Idle
                        | run_event::NodeStatus::Failed
                        | run_event::NodeStatus::Blocked => !turn_seen,
                    }
                }
                _ => true,
            }
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = config::load_and_apply("trellis", None);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let url = resolve_url(&args);
    match args.cmd {
        Command::Serve { addr } => {
            let engine = Engine::new(EngineSettings::from_env());
            serve::run_serve(addr.as_deref(), engine)
                .await
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        }
        Command::Run {
            message,
            role,
            provider,
            cwd,
        } => {
            cmd_run(url, args.json, message, role, provider, cwd).await?;
        }
        Command::Events { run_id } => {
            let client = Client::new(url);
            client
                .tail_events(&run_id, |envelope| {
                    print_event(&envelope, args.json);
                    true
                })
                .await?;
        }
    }
    Ok(())
}
