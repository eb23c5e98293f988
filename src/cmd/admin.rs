//! Terminal counterparts of the admin API: `repowatch status`, `jobs` and
//! `dispatch`.

use anyhow::{Context, Result, anyhow, bail};
use std::str::FromStr;
use std::sync::Arc;

use repowatch::config::RepowatchConfig;
use repowatch::jobs::admin::{self, JobAction};
use repowatch::jobs::dispatcher::{BatchDispatcher, DispatchFilter, DispatchOutcome, ForkMode};
use repowatch::jobs::executor::CandidateSource;
use repowatch::jobs::github::GitHubClient;
use repowatch::jobs::models::{
    EntityKey, JobPayload, OperationKind, ProcessingStatusRecord, check_credential_ref,
};

use super::super::JobsCommands;

fn parse_key(owner: &str, repo: &str) -> Result<EntityKey> {
    format!("{}/{}", owner, repo)
        .parse()
        .map_err(|e: String| anyhow!(e))
}

fn parse_operation(s: &str) -> Result<OperationKind> {
    OperationKind::from_str(s).map_err(|e| anyhow!(e))
}

fn print_statuses(records: &[ProcessingStatusRecord]) {
    if records.is_empty() {
        println!("No status records.");
        return;
    }
    println!(
        "{:<40} {:<18} {:<11} {:<25} ERROR",
        "REPOSITORY", "OPERATION", "STATUS", "UPDATED"
    );
    for record in records {
        println!(
            "{:<40} {:<18} {:<11} {:<25} {}",
            record.key.to_string(),
            record.operation.as_str(),
            record.status.as_str(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            record.error_message.as_deref().unwrap_or("")
        );
    }
}

pub async fn cmd_status(
    config: &RepowatchConfig,
    owner: Option<&str>,
    repo: Option<&str>,
    operation: Option<&str>,
) -> Result<()> {
    let ctx = config.open_jobs()?;
    let operation = operation.map(parse_operation).transpose()?;

    let records = match (owner, repo) {
        (Some(owner), Some(repo)) => {
            let key = parse_key(owner, repo)?;
            let mut records = ctx.status.get_statuses_for_key(&key).await?;
            if let Some(op) = operation {
                records.retain(|r| r.operation == op);
            }
            records
        }
        (None, None) => ctx.status.get_statuses(operation, &[]).await?,
        _ => bail!("--owner and --repo must be given together"),
    };
    print_statuses(&records);
    Ok(())
}

pub async fn cmd_jobs(config: &RepowatchConfig, command: JobsCommands) -> Result<()> {
    let ctx = config.open_jobs()?;

    let (queue, id, action) = match command {
        JobsCommands::List {
            queue,
            state,
            limit,
        } => {
            let states = admin::parse_states(state.as_deref().unwrap_or(""))
                .map_err(|e| anyhow!(e))?;
            let overview = admin::queue_overview(&ctx.registry, queue.as_deref(), &states, limit)
                .await?;
            for (name, snapshot) in &overview {
                let c = snapshot.counts;
                println!(
                    "{}: waiting={} active={} delayed={} paused={} completed={} failed={}",
                    name, c.waiting, c.active, c.delayed, c.paused, c.completed, c.failed
                );
                for (state, jobs) in &snapshot.jobs {
                    for job in jobs {
                        println!(
                            "  [{}] {} {} attempts={}/{}{}",
                            state,
                            job.id,
                            job.payload.key(),
                            job.attempts_made,
                            job.max_attempts,
                            job.failure_reason
                                .as_deref()
                                .map(|r| format!(" reason=\"{}\"", r))
                                .unwrap_or_default()
                        );
                    }
                }
            }
            return Ok(());
        }
        JobsCommands::Pause { queue, id } => (queue, id, JobAction::Pause),
        JobsCommands::Resume { queue, id } => (queue, id, JobAction::Resume),
        JobsCommands::Retry { queue, id } => (queue, id, JobAction::Retry),
        JobsCommands::Remove { queue, id } => (queue, id, JobAction::Remove),
    };

    let message = admin::apply_action(&ctx.registry, &queue, &id, action).await?;
    println!("{}", message);
    Ok(())
}

pub struct DispatchArgs<'a> {
    pub operation: &'a str,
    pub owner: &'a str,
    pub repo: Option<&'a str>,
    pub include_hidden: bool,
    pub forks: ForkMode,
    pub credential_ref: Option<&'a str>,
    pub force: bool,
}

pub async fn cmd_dispatch(config: &RepowatchConfig, args: DispatchArgs<'_>) -> Result<()> {
    let ctx = config.open_jobs()?;
    let operation = parse_operation(args.operation)?;
    if let Some(var) = args.credential_ref {
        check_credential_ref(var).map_err(|e| anyhow!(e))?;
    }
    let dispatcher = BatchDispatcher::new(Arc::new(ctx.registry.clone()), ctx.status.clone());
    let credential_ref = args.credential_ref.map(str::to_string);

    if let Some(repo) = args.repo {
        let key = parse_key(args.owner, repo)?;
        let payload = JobPayload::for_operation(operation, key.clone(), credential_ref)
            .with_options(args.force, None);
        let id = dispatcher.dispatch_one(payload).await?;
        println!("Queued {} for {} (job {})", operation, key, id);
        return Ok(());
    }

    let github = GitHubClient::new(
        &config.toml.github.api_url,
        &config.toml.github.token_env,
    )?;
    let candidates = github
        .list_candidates(args.owner, args.credential_ref)
        .await
        .with_context(|| format!("Failed to list repositories for {}", args.owner))?;
    let hidden = ctx.hidden.snapshot().await?;
    let filter = DispatchFilter {
        exclude_hidden: !args.include_hidden,
        forks: args.forks,
    };

    match dispatcher
        .dispatch_batch(operation, candidates, &hidden, filter, args.credential_ref)
        .await
    {
        DispatchOutcome::NothingToDo => println!("No repositories to {}", operation),
        DispatchOutcome::Dispatched(summary) => {
            println!(
                "Queued {} {} job(s) for {} ({} failed)",
                summary.queued, operation, args.owner, summary.failed
            );
        }
    }
    Ok(())
}
