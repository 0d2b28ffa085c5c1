use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

use relay_core::ids::SessionId;
use relay_engine::{
    AgentSpec, ConsoleSink, ConversationService, Orchestrator, OrchestratorConfig, ProgressSink,
    ToolRegistry,
};
use relay_llm::{ClientPool, PoolConfig, ResponsesBackend, ResponsesConfig};
use relay_store::{SessionStore, StoreConfig};
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Chat with a "hello" agent over stdin. Ctrl-C cancels the in-flight call;
/// Ctrl-C at the prompt exits.
#[derive(Parser, Debug)]
#[command(name = "relay", version)]
struct Args {
    #[arg(long, env = "RELAY_API_KEY", hide_env_values = true)]
    api_key: String,

    #[arg(long, env = "RELAY_MODEL", default_value = "gpt-4.1-mini")]
    model: String,

    #[arg(long, env = "RELAY_BASE_URL", default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Concurrent backend calls allowed across all sessions.
    #[arg(long, env = "RELAY_POOL_SIZE", default_value_t = 4)]
    pool_size: usize,

    /// Idle seconds before a session expires.
    #[arg(long, env = "RELAY_SESSION_TTL", default_value_t = 3600)]
    session_ttl: u64,

    #[arg(long, env = "RELAY_MAX_ITERATIONS", default_value_t = 10)]
    max_iterations: u32,

    /// Reasoning effort for reasoning-capable models (low, medium, high).
    #[arg(long, env = "RELAY_REASONING_EFFORT")]
    reasoning_effort: Option<String>,

    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "warn")]
    log_level: Level,

    #[arg(long, env = "RELAY_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = init_telemetry(
        TelemetryConfig::default()
            .with_level(args.log_level)
            .with_json(args.json_logs),
    );
    let metrics = telemetry.metrics();

    let mut backend_config = ResponsesConfig::new(SecretString::from(args.api_key), &args.model)
        .with_base_url(&args.base_url);
    if let Some(effort) = &args.reasoning_effort {
        backend_config = backend_config.with_reasoning(effort, true);
    }
    let backend = ResponsesBackend::new(backend_config).context("building HTTP backend")?;
    let pool = Arc::new(
        ClientPool::uniform(Arc::new(backend), args.pool_size, PoolConfig::default())
            .context("building client pool")?
            .with_metrics(metrics.clone()),
    );

    let store = Arc::new(
        SessionStore::new(
            StoreConfig::default().with_default_ttl(Duration::from_secs(args.session_ttl)),
        )
        .with_metrics(metrics.clone()),
    );
    let shutdown = CancellationToken::new();
    let sweeper = store.spawn_sweeper(shutdown.child_token());

    let orchestrator = Orchestrator::new(
        Arc::clone(&pool),
        OrchestratorConfig::default().with_max_iterations(args.max_iterations),
    )
    .with_metrics(metrics.clone());
    let service = ConversationService::new(Arc::clone(&store), Arc::new(orchestrator));

    let agent = hello_agent()?;
    let session = SessionId::new();
    store.get_or_create(&session, None);
    info!(
        session_id = %session,
        model = %args.model,
        pool_size = args.pool_size,
        "relay ready"
    );
    println!("relay: chatting with the {} agent (/reset, /stats, Ctrl-C to quit)", agent.agent_type);

    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleSink::stdout());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else { break };
        let prompt = line.trim();

        match prompt {
            "" => continue,
            "/reset" => {
                store.get_or_create(&session, None);
                match service.reset_agent(&session, &agent.agent_type) {
                    Ok(_) => println!("conversation reset"),
                    Err(e) => println!("reset failed: {e}"),
                }
                continue;
            }
            "/stats" => {
                println!("{}", serde_json::to_string_pretty(&pool.stats())?);
                if let Some(m) = &metrics {
                    println!("{}", serde_json::to_string_pretty(&m.snapshot())?);
                }
                continue;
            }
            _ => {}
        }

        // An idle session may have expired since the last prompt.
        store.get_or_create(&session, None);
        let cancel = shutdown.child_token();
        let call = service.send_text(&session, &agent, prompt, Arc::clone(&sink), &cancel);
        tokio::pin!(call);
        let outcome = tokio::select! {
            outcome = &mut call => outcome,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                call.await
            }
        };

        // The console sink has already printed the result or error line.
        match outcome {
            Ok(result) => debug!(
                iterations = result.iterations,
                tokens = result.usage.total(),
                "turn complete"
            ),
            Err(e) => warn!(error = %e, kind = e.error_kind(), "turn failed"),
        }
    }

    info!("shutting down");
    shutdown.cancel();
    pool.close();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "session sweeper ended abnormally");
    }
    Ok(())
}

fn hello_agent() -> anyhow::Result<AgentSpec> {
    let mut tools = ToolRegistry::new();
    tools.register_fn(
        "get_current_time",
        "Get the current date and time in UTC",
        json!({"type": "object", "properties": {}, "additionalProperties": false}),
        |_| async {
            let now = chrono::Utc::now();
            Ok(json!({
                "utc": now.to_rfc3339(),
                "weekday": now.format("%A").to_string(),
            }))
        },
    )?;

    Ok(AgentSpec::new(
        "hello",
        "You are a friendly assistant. Greet the user warmly and keep answers short. \
         Use the get_current_time tool whenever the current date or time matters.",
    )
    .with_tools(tools))
}
