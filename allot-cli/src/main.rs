mod backends;
mod handlers;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use allot_core::types::{IssuanceMode, Issued, ReserveRequest, ResourcePolicy};
use allot_core::{FinalizeWorker, IssuanceEngine, IssuanceError, MeteredEngine, Reconciler};

use crate::handlers::*;

#[derive(Parser)]
#[command(
    name = "allot",
    about = "Allot: quota-bounded issuance without over-issuing",
    version
)]
struct Cli {
    /// Engine settings (TOML)
    #[arg(long, global = true, env = "ALLOT_CONFIG")]
    config: Option<PathBuf>,

    /// Storage backend: "memory" or "sqlite:<path>"
    #[arg(long, global = true, default_value = "memory", env = "ALLOT_STORAGE")]
    storage: String,

    /// Redis URL for locks, counters, cache and queue (in-memory when unset)
    #[arg(long, global = true, env = "ALLOT_REDIS")]
    redis: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Activate a resource policy from a JSON document (stdin)
    Activate,

    /// Reserve a resource along the path its policy selects
    Reserve {
        resource: String,
        requester: String,
        #[arg(long, default_value_t = 1)]
        quantity: i64,
    },

    /// Confirm a RESERVED record
    Confirm { record: String, requester: String },

    /// Redeem a record against an order
    Use {
        record: String,
        requester: String,
        order: String,
    },

    /// Cancel a record and return its quota
    Cancel { record: String, requester: String },

    /// Status of a deferred reservation
    Poll { resource: String, ticket: String },

    /// Finalize queued intents until Ctrl-C (needs --redis)
    Worker {
        /// Consume the dead-letter topic instead
        #[arg(long)]
        dead_letters: bool,
    },

    /// Compare live counters with durable records
    Reconcile {
        #[arg(required = true)]
        resources: Vec<String>,

        /// Keep running, one pass every N seconds
        #[arg(long)]
        every: Option<u64>,
    },

    /// Burst of concurrent requesters against one in-process resource
    Simulate {
        #[arg(long, default_value_t = 100)]
        total: i64,
        #[arg(long, default_value_t = 500)]
        requesters: usize,
        /// Use the reserve/finalize split
        #[arg(long)]
        deferred: bool,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        emit(&ApiResponse::ok(VersionInfo {
            name: "allot",
            version: env!("CARGO_PKG_VERSION"),
        }));
        return ExitCode::SUCCESS;
    }

    let config = match backends::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return usage_error(e.to_string()),
    };

    if let Commands::Simulate {
        total,
        requesters,
        deferred,
    } = cli.command
    {
        // always local: a burst against shared state would be a load test
        let engine = match IssuanceEngine::new(allot_core::Ports::in_memory(), config) {
            Ok(engine) => Arc::new(engine),
            Err(e) => return usage_error(e.to_string()),
        };
        return simulate(engine, total, requesters, deferred).await;
    }

    if let Commands::Worker { .. } = cli.command {
        if let Err(e) = require_shared_queue(cli.redis.as_deref()) {
            return usage_error(e);
        }
    }

    let local_queue = cli.redis.is_none();
    let engine = match backends::build_engine(&cli.storage, cli.redis.as_deref(), config).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => return usage_error(e),
    };
    let metered = MeteredEngine::new(Arc::clone(&engine));

    match cli.command {
        Commands::Activate => {
            eprintln!("Reading policy from stdin...");
            let mut input = String::new();
            if let Err(e) = std::io::Read::read_to_string(&mut std::io::stdin(), &mut input) {
                return usage_error(format!("Failed to read stdin: {e}"));
            }
            match parse_policy(&input) {
                Ok(policy) => respond(metered.activate(policy).await),
                Err(e) => usage_error(e),
            }
        }
        Commands::Reserve {
            resource,
            requester,
            quantity,
        } => {
            let request = ReserveRequest::new(resource, requester).with_quantity(quantity);
            respond(reserve(&engine, &metered, &request, local_queue).await)
        }
        Commands::Confirm { record, requester } => {
            respond(metered.confirm(&record, &requester).await)
        }
        Commands::Use {
            record,
            requester,
            order,
        } => {
            if let Err(e) = validate_id("order", &order) {
                return usage_error(e);
            }
            respond(metered.use_record(&record, &requester, order).await)
        }
        Commands::Cancel { record, requester } => {
            respond(metered.cancel(&record, &requester).await)
        }
        Commands::Poll { resource, ticket } => {
            respond(metered.poll_result(&resource, &ticket).await)
        }
        Commands::Worker { dead_letters } => {
            let shutdown = shutdown_on_ctrl_c();
            let worker = FinalizeWorker::new(engine);
            let handled = if dead_letters {
                tracing::info!("Consuming dead letters");
                worker.run_dead_letters(shutdown).await
            } else {
                tracing::info!("Finalizing intents");
                worker.run(shutdown).await
            };
            tracing::info!("Handled {} message(s)", handled);
            ExitCode::SUCCESS
        }
        Commands::Reconcile { resources, every } => {
            let reconciler = Reconciler::new(engine);
            match every {
                Some(secs) => {
                    let shutdown = shutdown_on_ctrl_c();
                    reconciler
                        .run_periodic(Duration::from_secs(secs.max(1)), &resources, shutdown)
                        .await;
                    ExitCode::SUCCESS
                }
                None => {
                    let mut reports = Vec::with_capacity(resources.len());
                    for resource in &resources {
                        match reconciler.reconcile(resource).await {
                            Ok(report) => reports.push(report),
                            Err(e) => return respond::<()>(Err(e)),
                        }
                    }
                    respond(Ok(reports))
                }
            }
        }
        Commands::Simulate { .. } | Commands::Version => ExitCode::SUCCESS,
    }
}

/// A worker on a process-local queue would never see another process's
/// intents.
fn require_shared_queue(redis_url: Option<&str>) -> Result<(), String> {
    match redis_url {
        Some(_) => Ok(()),
        None => Err("worker needs a shared queue: pass --redis".to_string()),
    }
}

/// Reserve along the policy's path. A process-local queue dies with this
/// process, so its intents are finalized before answering.
async fn reserve(
    engine: &Arc<IssuanceEngine>,
    metered: &MeteredEngine,
    request: &ReserveRequest,
    local_queue: bool,
) -> Result<IssueResponse, IssuanceError> {
    let ticket = match metered.issue(request).await? {
        Issued::Ticket(ticket) => ticket,
        issued => return Ok(issued.into()),
    };
    if !local_queue {
        return Ok(IssueResponse::Deferred {
            ticket,
            outcome: None,
        });
    }

    let worker = FinalizeWorker::new(Arc::clone(engine)).with_poll_wait(Duration::ZERO);
    let finalized = worker.drain().await?;
    let dead = worker.drain_dead_letters().await?;
    tracing::info!("Finalized {} intent(s) locally, {} dead-lettered", finalized, dead);

    let outcome = engine
        .poll_result(&ticket.resource_id, &ticket.ticket_id)
        .await?;
    Ok(IssueResponse::Deferred {
        ticket,
        outcome: Some(outcome),
    })
}

fn respond<T: Serialize>(result: Result<T, IssuanceError>) -> ExitCode {
    match result {
        Ok(data) => {
            emit(&ApiResponse::ok(data));
            ExitCode::SUCCESS
        }
        Err(e) => {
            emit(&ApiResponse::<()>::err(ErrorBody::from(&e)));
            ExitCode::FAILURE
        }
    }
}

fn usage_error(message: impl Into<String>) -> ExitCode {
    emit(&ApiResponse::<()>::err(ErrorBody::usage(message)));
    ExitCode::from(2)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        trigger.cancel();
    });
    token
}

async fn simulate(
    engine: Arc<IssuanceEngine>,
    total: i64,
    requesters: usize,
    deferred: bool,
) -> ExitCode {
    let now = chrono::Utc::now();
    let mode = if deferred {
        IssuanceMode::Deferred
    } else {
        IssuanceMode::Synchronous
    };
    let policy = ResourcePolicy::new(
        "simulated",
        total,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::hours(1),
    )
    .with_mode(mode);

    if let Err(e) = engine.activate(policy).await {
        return respond::<()>(Err(e));
    }

    let started = Instant::now();
    let tasks: Vec<_> = (0..requesters)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let request = ReserveRequest::new("simulated", format!("requester-{i}"));
                engine.issue(&request).await
            })
        })
        .collect();

    let mut report = SimulationReport {
        total,
        requesters,
        deferred,
        granted: 0,
        exhausted: 0,
        busy: 0,
        other_errors: 0,
        remaining: None,
        elapsed_ms: 0,
    };
    for task in tasks {
        match task.await {
            Ok(Ok(_)) => report.granted += 1,
            Ok(Err(IssuanceError::Exhausted { .. })) => report.exhausted += 1,
            Ok(Err(IssuanceError::Busy { .. })) => report.busy += 1,
            Ok(Err(e)) => {
                tracing::warn!("Reserve failed: {}", e);
                report.other_errors += 1;
            }
            Err(e) => {
                tracing::error!("Requester task panicked: {}", e);
                report.other_errors += 1;
            }
        }
    }
    report.elapsed_ms = started.elapsed().as_millis();

    if deferred {
        let worker = FinalizeWorker::new(Arc::clone(&engine)).with_poll_wait(Duration::ZERO);
        match worker.drain().await {
            Ok(finalized) => tracing::info!("Finalized {} intent(s)", finalized),
            Err(e) => return respond::<()>(Err(e)),
        }
    }

    report.remaining = engine.remaining("simulated").await.ok().flatten();
    emit(&ApiResponse::ok(report));
    ExitCode::SUCCESS
}
