//! playbook - self-curating bullet memory for agents
//!
//! Usage:
//!   playbook add "Always check the exit code" --group left
//!   playbook retrieve "deploy rollback" --groups left,shared
//!   playbook outcome run-42 <id>... [--harmful]
//!   playbook learn trace.json
//!   playbook maintain --prune --dry-run
//!   playbook suggestions --deliver
//!   playbook daemon --log-dir ~/.playbook/logs
//!   playbook --dump-config

use anyhow::Context;
use clap::{Parser, Subcommand};
use playbook_core::config::PrunePolicy;
use playbook_core::{BulletKind, ExecutionTrace, Group, PlaybookConfig, Privilege};
use playbook_learning::{MaintenancePlan, MaintenanceTask, Playbook, ReviewPriority, TickRate};
use playbook_store::SuggestionStatus;
use playbook_llm::{AnthropicGenerator, Generator};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "playbook",
    about = "Self-curating bullet memory with an execution-pressure controller",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Store root (overrides storage.root)
    #[arg(long, global = true)]
    root: Option<String>,

    /// Path to config file (TOML). Default: <root>/playbook.toml
    #[arg(long, global = true)]
    config: Option<String>,

    /// Dump default config as TOML and exit
    #[arg(long)]
    dump_config: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a bullet (staged and routed unless --bootstrap)
    Add {
        text: String,
        /// Group hint: left or right
        #[arg(short, long, default_value = "left")]
        group: Group,
        #[arg(short, long, default_value = "heuristic")]
        kind: BulletKind,
        /// Comma-separated tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(short, long, default_value_t = 0.7)]
        confidence: f64,
        /// Skip staging and land QUARANTINED in the group
        #[arg(long)]
        bootstrap: bool,
    },
    /// Similarity search across groups
    Retrieve {
        query: String,
        #[arg(short, long, value_delimiter = ',', default_value = "left,right,shared")]
        groups: Vec<Group>,
        #[arg(short, default_value_t = 8)]
        k: usize,
        #[arg(long, default_value_t = 0.0)]
        min_confidence: f64,
    },
    /// Record a helpful or harmful outcome for bullets
    Outcome {
        outcome_id: String,
        ids: Vec<String>,
        /// Count as harmful instead of helpful
        #[arg(long)]
        harmful: bool,
    },
    /// List staged bullets awaiting review
    Staged {
        #[arg(short, long)]
        priority: Option<ReviewPriority>,
    },
    /// Assign a staged bullet to left or right
    Assign {
        id: String,
        group: Group,
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
    /// Reject a staged bullet (backed up, then removed)
    Reject {
        id: String,
        #[arg(long, default_value = "rejected")]
        reason: String,
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
    /// Run dedup, prune and promotion passes. No pass flags means all.
    Maintain {
        #[arg(short, long)]
        group: Option<Group>,
        #[arg(long)]
        prune: bool,
        #[arg(long)]
        dedup: bool,
        #[arg(long)]
        promote: bool,
        #[arg(long)]
        dry_run: bool,
        /// Allow prune runs above the confirmation threshold
        #[arg(long)]
        force: bool,
        /// Override pruning.policy for this run
        #[arg(long)]
        policy: Option<PrunePolicy>,
    },
    /// Learn from an execution trace (JSON file)
    Learn {
        trace: PathBuf,
        /// Fixed tick rate instead of the controller's
        #[arg(long)]
        tick_rate: Option<f64>,
    },
    /// List backups, newest first
    Backups,
    /// Restore every bullet in a backup
    Rollback {
        backup_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Restore bullets from their newest backups
    Restore {
        ids: Vec<String>,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Quality distribution per group
    Quality {
        #[arg(short, long)]
        group: Option<Group>,
    },
    /// Controller metrics, optionally after advancing some ticks
    Metrics {
        #[arg(long, default_value_t = 0)]
        ticks: u32,
    },
    /// List, deliver or resolve cross-hemisphere suggestions
    Suggestions {
        #[arg(long)]
        status: Option<SuggestionStatus>,
        /// Target group: left or right
        #[arg(long)]
        to: Option<Group>,
        /// Deliver pending suggestions now, ignoring controller load
        #[arg(long, conflicts_with_all = ["accept", "reject"])]
        deliver: bool,
        #[arg(long, value_name = "ID", conflicts_with = "reject")]
        accept: Option<String>,
        #[arg(long, value_name = "ID")]
        reject: Option<String>,
        #[arg(long, default_value = "operator")]
        reason: String,
    },
    /// Run the controller loop and maintenance scheduler until Ctrl-C
    Daemon {
        /// Also write daily-rotated logs here
        #[arg(long)]
        log_dir: Option<String>,
        /// Checkpoint the controller every N ticks
        #[arg(long, default_value_t = 50)]
        checkpoint_every: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump_config {
        println!("{}", PlaybookConfig::default().to_toml());
        return Ok(());
    }

    let log_dir = match &cli.command {
        Some(Commands::Daemon { log_dir, .. }) => log_dir.as_deref().map(expand_tilde),
        _ => None,
    };
    let _log_guard = init_tracing(cli.log_json, log_dir)?;

    let default_root = cli.root.clone().unwrap_or_else(|| PlaybookConfig::default().storage.root);
    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(|| expand_tilde(&default_root).join("playbook.toml"));
    let mut config = PlaybookConfig::load(&config_path);
    if let Some(root) = &cli.root {
        config.storage.root = root.clone();
    }
    if let Some(Commands::Maintain { policy: Some(policy), .. }) = &cli.command {
        config.pruning.policy = *policy;
    }

    let root = expand_tilde(&config.storage.root);
    std::fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
    let generator = AnthropicGenerator::from_config(&config.llm).map(|g| Arc::new(g) as Arc<dyn Generator>);
    if generator.is_none() {
        tracing::info!("No generator configured; deep reflection and tie-breaks degrade");
    }
    let mut playbook = Playbook::open(config, &root, generator)?;

    match cli.command {
        None => {
            print_json(&playbook.store().stats())?;
        }
        Some(Commands::Add { text, group, kind, tags, confidence, bootstrap }) => {
            let privilege = if bootstrap { Privilege::Bootstrap } else { Privilege::Normal };
            let outcome = playbook.add_with_privilege(&text, group, kind, tags, confidence, privilege).await?;
            print_json(&outcome)?;
        }
        Some(Commands::Retrieve { query, groups, k, min_confidence }) => {
            let (bullets, _) = playbook.retrieve(&query, &groups, k, min_confidence);
            for b in &bullets {
                println!("{}  [{} {} {:.2}]  {}", b.id, b.group, b.kind, b.confidence, b.text);
            }
            if bullets.is_empty() {
                println!("no matches");
            }
        }
        Some(Commands::Outcome { outcome_id, ids, harmful }) => {
            print_json(&playbook.record_outcome(&outcome_id, &ids, !harmful)?)?;
        }
        Some(Commands::Staged { priority }) => {
            for b in playbook.list_staged(priority) {
                println!(
                    "{}  [{} -> {}]  {}",
                    b.id,
                    b.meta_str("review_priority").unwrap_or("unrouted"),
                    b.meta_str("classifier_suggestion").unwrap_or("?"),
                    b.text
                );
            }
        }
        Some(Commands::Assign { id, group, reviewer }) => {
            print_json(&playbook.assign_staged_bullet(&id, group, &reviewer)?)?;
        }
        Some(Commands::Reject { id, reason, reviewer }) => {
            let manifest = playbook.reject_staged_bullet(&id, &reason, &reviewer)?;
            println!("rejected {id}, backup {}", manifest.backup_id);
        }
        Some(Commands::Maintain { group, prune, dedup, promote, dry_run, force, .. }) => {
            let all = !(prune || dedup || promote);
            let plan = MaintenancePlan {
                prune: prune || all,
                dedup: dedup || all,
                promote: promote || all,
                dry_run,
                force,
            };
            print_json(&playbook.run_maintenance(group, &plan)?)?;
        }
        Some(Commands::Learn { trace, tick_rate }) => {
            let json = std::fs::read_to_string(&trace).with_context(|| format!("reading {}", trace.display()))?;
            let trace: ExecutionTrace = serde_json::from_str(&json).context("parsing execution trace")?;
            let rate = tick_rate.map_or(TickRate::Auto, TickRate::Fixed);
            print_json(&playbook.learn_from_trace(&trace, rate).await?)?;
        }
        Some(Commands::Backups) => {
            for m in playbook.list_backups()? {
                println!("{}  {}  {} bullets  {} ({})", m.backup_id, m.created_at, m.bullet_count, m.reason, m.actor);
            }
        }
        Some(Commands::Rollback { backup_id, actor }) => {
            let manifest = playbook.rollback(&backup_id, &actor)?;
            println!("restored {} bullets from {}", manifest.bullet_count, manifest.backup_id);
        }
        Some(Commands::Restore { ids, actor }) => {
            let restored = playbook.restore_bullets(&ids, &actor)?;
            println!("restored {}/{}: {}", restored.len(), ids.len(), restored.join(", "));
        }
        Some(Commands::Quality { group }) => {
            let groups = group.map_or_else(|| vec![Group::Left, Group::Right, Group::Shared], |g| vec![g]);
            for g in groups {
                let d = playbook.quality_report(g);
                println!(
                    "{g:<7} total {:>4}  mean {:.2}  excellent {} good {} fair {} poor {} very_poor {}",
                    d.total, d.mean, d.excellent, d.good, d.fair, d.poor, d.very_poor
                );
            }
        }
        Some(Commands::Metrics { ticks }) => {
            let interval = playbook.get_consciousness_metrics().current_tick_interval;
            for _ in 0..ticks {
                if let Some(decision) = playbook.tick(interval) {
                    println!("tick {}: {}", decision.tick, decision.decision);
                }
            }
            print_json(&playbook.get_consciousness_metrics())?;
        }
        Some(Commands::Suggestions { status, to, deliver, accept, reject, reason }) => {
            if deliver {
                print_json(&playbook.deliver_suggestions(None, to)?)?;
            } else if let Some(id) = accept {
                print_json(&playbook.resolve_suggestion(&id, true, &reason)?)?;
            } else if let Some(id) = reject {
                print_json(&playbook.resolve_suggestion(&id, false, &reason)?)?;
            } else {
                let suggestions = playbook.list_suggestions(status, to);
                for s in &suggestions {
                    println!(
                        "{}  [{} {} -> {}]  {}",
                        s.suggestion_id, s.status, s.from_side, s.to_side, s.suggested_text
                    );
                }
                if suggestions.is_empty() {
                    println!("no suggestions");
                }
            }
        }
        Some(Commands::Daemon { checkpoint_every, .. }) => {
            run_daemon(&mut playbook, checkpoint_every).await?;
        }
    }

    playbook.shutdown();
    Ok(())
}

async fn run_daemon(playbook: &mut Playbook, checkpoint_every: u64) -> anyhow::Result<()> {
    let controller = playbook
        .start_controller_loop(checkpoint_every)
        .context("controller loop already running")?;

    let scheduler = Arc::new(playbook.scheduler());
    for status in scheduler.status() {
        tracing::info!(
            task = %status.task,
            schedule = ?status.schedule,
            next = ?status.next_run,
            "maintenance schedule"
        );
    }
    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

    tracing::info!("Playbook daemon running at {}", playbook.root().display());
    if playbook.config().suggestions.enabled {
        let mut delivery = tokio::time::interval(std::time::Duration::from_secs(
            playbook.config().maintenance.check_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
                _ = delivery.tick() => {
                    match playbook.deliver_suggestions(Some(playbook.tick_profile()), None) {
                        Ok(report) if !report.delivered.is_empty() => {
                            tracing::info!(delivered = report.delivered.len(), "suggestions delivered");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Suggestion delivery failed: {}", e),
                    }
                }
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("Shutting down");

    cancel.cancel();
    match scheduler_task.await {
        Ok(()) => {
            let runs: Vec<MaintenanceTask> = scheduler.history().into_iter().map(|r| r.task).collect();
            tracing::info!(runs = runs.len(), "scheduler stopped");
        }
        Err(e) => tracing::warn!("Scheduler task failed: {}", e),
    }
    if let Some(controller) = controller.shutdown().await {
        tracing::info!(ticks = controller.state().tick_count, "controller stopped");
    }
    Ok(())
}

fn init_tracing(json: bool, log_dir: Option<PathBuf>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "playbook=info,playbook_learning=info,playbook_store=info,playbook_controller=info".into());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "playbook.log"));
            (Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
