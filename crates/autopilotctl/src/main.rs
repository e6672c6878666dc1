//! autopilotctl - CLI client for autopilotd

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};

use autopilot_core::{CriticResult, Id, NewTask, PlanProposal, TaskStatus};
use clap::{Parser, Subcommand};
use client::{Client, ClientError, TransitionRequest};

const DEFAULT_ADDR: &str = "http://127.0.0.1:7800";
const DEFAULT_HOLDER: &str = "autopilotctl";

/// CLI client for the autopilotd task control plane.
#[derive(Parser)]
#[command(name = "autopilotctl")]
#[command(about = "Control plane client for autopilotd")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7800)
    #[arg(long, global = true, env = "AUTOPILOT_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "AUTOPILOT_AUTH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List tasks
    Tasks {
        /// Filter by status (pending, in_progress, needs_review, ...)
        #[arg(long, value_parser = parse_task_status)]
        status: Option<TaskStatus>,
    },

    /// Show task details
    Show {
        /// Task ID
        task_id: String,
    },

    /// Create a task
    Create {
        /// Task title
        title: String,

        /// Work type
        #[arg(long = "type", default_value = "feature")]
        task_type: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Task that must be done first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        #[arg(long)]
        parent: Option<String>,
    },

    /// Move a task along a lifecycle edge
    Transition {
        /// Task ID
        task_id: String,

        /// Target status
        #[arg(value_parser = parse_task_status)]
        to: TaskStatus,

        /// Idempotency key; replays with the same key are no-ops
        #[arg(long)]
        correlation_id: Option<String>,

        /// Agent recorded on the audit event
        #[arg(long)]
        agent: Option<String>,
    },

    /// Cancel a queued or running task
    Cancel {
        /// Task ID
        task_id: String,
    },

    /// Claim a task for an external agent
    Lease {
        /// Task ID
        task_id: String,

        /// Lease holder name
        #[arg(long, env = "AUTOPILOT_AGENT", default_value = DEFAULT_HOLDER)]
        holder: String,

        /// Lease TTL in seconds (default: the daemon's configured TTL)
        #[arg(long)]
        ttl_sec: Option<u64>,
    },

    /// Heartbeat a held lease
    Renew {
        /// Task ID
        task_id: String,

        #[arg(long, env = "AUTOPILOT_AGENT", default_value = DEFAULT_HOLDER)]
        holder: String,
    },

    /// Give a held lease back
    Release {
        /// Task ID
        task_id: String,

        #[arg(long, env = "AUTOPILOT_AGENT", default_value = DEFAULT_HOLDER)]
        holder: String,
    },

    /// List pending tasks whose dependencies are done
    Ready,

    /// Show roadmap health
    Health,

    /// List consensus decisions for a task
    Decisions {
        /// Task ID
        task_id: String,
    },

    /// Review a plan file (YAML, or JSON by extension)
    ReviewPlan {
        /// Path to the plan file
        file: PathBuf,

        /// Task the plan belongs to
        #[arg(long)]
        task: Option<String>,
    },

    /// Report a critic run
    Critic {
        /// Critic name
        name: String,

        #[arg(long, conflicts_with = "fail", required_unless_present = "fail")]
        pass: bool,

        #[arg(long)]
        fail: bool,

        /// History origin (default: the daemon's monitored origin)
        #[arg(long)]
        origin: Option<String>,
    },
}

fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    s.parse::<TaskStatus>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Tasks { status } => task_list(&client, status).await,
        Command::Show { task_id } => task_show(&client, &task_id).await,
        Command::Create {
            title,
            task_type,
            description,
            depends_on,
            parent,
        } => task_create(&client, title, task_type, description, depends_on, parent).await,
        Command::Transition {
            task_id,
            to,
            correlation_id,
            agent,
        } => {
            let req = TransitionRequest {
                to,
                correlation_id,
                agent,
            };
            task_transition(&client, &task_id, &req).await
        }
        Command::Cancel { task_id } => task_cancel(&client, &task_id).await,
        Command::Lease {
            task_id,
            holder,
            ttl_sec,
        } => lease_acquire(&client, &task_id, &holder, ttl_sec).await,
        Command::Renew { task_id, holder } => lease_renew(&client, &task_id, &holder).await,
        Command::Release { task_id, holder } => lease_release(&client, &task_id, &holder).await,
        Command::Ready => task_ready(&client).await,
        Command::Health => roadmap_health(&client).await,
        Command::Decisions { task_id } => task_decisions(&client, &task_id).await,
        Command::ReviewPlan { file, task } => review_plan(&client, &file, task.as_deref()).await,
        Command::Critic {
            name,
            pass,
            fail: _,
            origin,
        } => critic_report(&client, name, pass, origin.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn task_list(client: &Client, status: Option<TaskStatus>) -> Result<(), ClientError> {
    let tasks = client.list_tasks(status).await?;
    render::print_task_list(&tasks);
    Ok(())
}

async fn task_show(client: &Client, task_id: &str) -> Result<(), ClientError> {
    let task = client.get_task(task_id).await?;
    render::print_task_details(&task);
    Ok(())
}

async fn task_create(
    client: &Client,
    title: String,
    task_type: String,
    description: String,
    depends_on: Vec<String>,
    parent: Option<String>,
) -> Result<(), ClientError> {
    let new_task = NewTask {
        description,
        depends_on: depends_on.into_iter().map(Id::from_string).collect(),
        parent_id: parent.map(Id::from_string),
        ..NewTask::new(title, task_type)
    };
    let task = client.create_task(&new_task).await?;
    render::print_task_created(&task);
    Ok(())
}

async fn task_transition(
    client: &Client,
    task_id: &str,
    req: &TransitionRequest,
) -> Result<(), ClientError> {
    let outcome = client.transition(task_id, req).await?;
    if outcome.applied {
        println!("Task {} is now {}", outcome.task.id, outcome.task.status);
    } else {
        println!(
            "Task {} unchanged (correlation id already applied), status {}",
            outcome.task.id, outcome.task.status
        );
    }
    Ok(())
}

async fn task_cancel(client: &Client, task_id: &str) -> Result<(), ClientError> {
    let outcome = client.cancel_task(task_id).await?;
    println!("Task {task_id}: {outcome}");
    Ok(())
}

async fn lease_acquire(
    client: &Client,
    task_id: &str,
    holder: &str,
    ttl_sec: Option<u64>,
) -> Result<(), ClientError> {
    let lease = client.acquire_lease(task_id, holder, ttl_sec).await?;
    render::print_lease(&lease);
    Ok(())
}

async fn lease_renew(client: &Client, task_id: &str, holder: &str) -> Result<(), ClientError> {
    let lease = client.renew_lease(task_id, holder).await?;
    render::print_lease(&lease);
    Ok(())
}

async fn lease_release(client: &Client, task_id: &str, holder: &str) -> Result<(), ClientError> {
    if client.release_lease(task_id, holder).await? {
        println!("Released lease on {task_id}");
    } else {
        println!("No lease held on {task_id}");
    }
    Ok(())
}

async fn task_ready(client: &Client) -> Result<(), ClientError> {
    let tasks = client.ready_tasks().await?;
    render::print_task_list(&tasks);
    Ok(())
}

async fn roadmap_health(client: &Client) -> Result<(), ClientError> {
    let health = client.roadmap_health().await?;
    render::print_health(&health);
    Ok(())
}

async fn task_decisions(client: &Client, task_id: &str) -> Result<(), ClientError> {
    let decisions = client.list_decisions(task_id).await?;
    render::print_decisions(&decisions);
    Ok(())
}

async fn review_plan(
    client: &Client,
    file: &Path,
    task_id: Option<&str>,
) -> Result<(), ClientError> {
    let plan = PlanProposal::from_file(file)
        .map_err(|e| ClientError::InvalidInput(format!("{}: {e}", file.display())))?;
    let review = client.review_plan(&plan, task_id).await?;
    render::print_plan_review(&review);
    if review.approved {
        Ok(())
    } else {
        Err(ClientError::Conflict("plan has blocking concerns".to_string()))
    }
}

async fn critic_report(
    client: &Client,
    name: String,
    passed: bool,
    origin: Option<&str>,
) -> Result<(), ClientError> {
    let result = CriticResult::new(name, passed);
    let response = client.record_critic_result(&result, origin).await?;
    let pretty = serde_json::to_string_pretty(&response)
        .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
    println!("{pretty}");
    Ok(())
}
