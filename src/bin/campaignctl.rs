use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use campaign_dispatch::campaign::{self, DispatchOutcome};
use campaign_dispatch::db::{self, delivery, queue};
use campaign_dispatch::model::Campaign;
use campaign_dispatch::{config, render};

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage users, subscribers and campaigns")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a campaign owner (or print the existing one's id)
    CreateUser { name: String, email: String },
    /// Add an active subscriber to an owner's list
    AddSubscriber {
        #[arg(long)]
        user: i64,
        email: String,
        name: String,
    },
    /// List an owner's subscribers with their unsubscribe links
    Subscribers {
        #[arg(long)]
        user: i64,
    },
    /// Unsubscribe one of an owner's subscribers
    RemoveSubscriber {
        #[arg(long)]
        user: i64,
        id: i64,
        /// Delete the subscriber instead of marking it unsubscribed
        #[arg(long)]
        delete: bool,
    },
    /// Process an unsubscribe link token
    Unsubscribe { token: String },
    /// Create a draft campaign
    CreateCampaign {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
    /// Replace the content of a draft or scheduled campaign
    Update {
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
    /// Schedule a campaign at an RFC 3339 timestamp
    Schedule { id: i64, at: String },
    /// Return a scheduled campaign to draft
    Unschedule { id: i64 },
    /// Start sending a draft or scheduled campaign now
    Send { id: i64 },
    /// Re-send to the recipients of a failed campaign whose delivery failed
    Retry { id: i64 },
    /// Show a campaign's status and progress
    Status { id: i64 },
    /// List an owner's campaigns
    Campaigns {
        #[arg(long)]
        user: i64,
    },
    /// Show per-recipient delivery records of a campaign
    Deliveries {
        id: i64,
        /// Only failed records
        #[arg(long)]
        failed: bool,
    },
    /// Number of dispatch tasks waiting in the queue
    Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::CreateUser { name, email } => {
            let id = db::get_or_create_user(&pool, &name, &email).await?;
            let user = db::get_user(&pool, id)
                .await?
                .with_context(|| format!("user {id} not found"))?;
            println!("user {} {} <{}>", user.id, user.name, user.email);
        }
        Command::AddSubscriber { user, email, name } => {
            let sub = db::create_subscriber(&pool, user, &email, &name).await?;
            println!("subscriber {} token {}", sub.id, sub.unsubscribe_token);
        }
        Command::Subscribers { user } => {
            let base = cfg.mail.unsubscribe_base_url.as_deref();
            for sub in db::list_subscribers(&pool, user).await? {
                let link = render::unsubscribe_url(base, &sub.unsubscribe_token)
                    .unwrap_or_else(|| sub.unsubscribe_token.clone());
                println!("{}\t{}\t{}\t{}\t{}", sub.id, sub.status.as_str(), sub.email, sub.name, link);
            }
        }
        Command::RemoveSubscriber { user, id, delete } => {
            if delete {
                if !db::delete_subscriber(&pool, user, id).await? {
                    bail!("subscriber {id} not found for user {user}");
                }
                println!("deleted subscriber {id}");
            } else {
                let sub = db::unsubscribe_subscriber(&pool, user, id, Utc::now())
                    .await?
                    .with_context(|| format!("subscriber {id} not found for user {user}"))?;
                println!("subscriber {} is {}", sub.id, sub.status.as_str());
            }
        }
        Command::Unsubscribe { token } => match db::unsubscribe_by_token(&pool, &token, Utc::now()).await? {
            Some(sub) => println!("{} has been unsubscribed", sub.email),
            None => bail!("unknown unsubscribe token"),
        },
        Command::CreateCampaign {
            user,
            name,
            subject,
            body,
        } => {
            let id = db::create_campaign(&pool, user, &name, &subject, &body).await?;
            println!("campaign {id}");
        }
        Command::Update {
            id,
            name,
            subject,
            body,
        } => {
            campaign::update_content(&pool, id, &name, &subject, &body).await?;
            println!("campaign {id} updated");
        }
        Command::Schedule { id, at } => {
            let at = DateTime::parse_from_rfc3339(&at)
                .with_context(|| format!("invalid timestamp {at}"))?
                .with_timezone(&Utc);
            campaign::schedule(&pool, id, at).await?;
            println!("campaign {id} scheduled for {}", at.to_rfc3339());
        }
        Command::Unschedule { id } => {
            campaign::unschedule(&pool, id).await?;
            println!("campaign {id} returned to draft");
        }
        Command::Send { id } => {
            let outcome = campaign::send_now(&pool, id).await?;
            print_outcome(id, outcome);
        }
        Command::Retry { id } => {
            let outcome = campaign::retry_failed(&pool, id).await?;
            print_outcome(id, outcome);
        }
        Command::Status { id } => {
            let c = db::get_campaign(&pool, id)
                .await?
                .with_context(|| format!("campaign {id} not found"))?;
            print_campaign(&c);
        }
        Command::Campaigns { user } => {
            for c in db::list_campaigns(&pool, user).await? {
                print_campaign(&c);
            }
        }
        Command::Deliveries { id, failed } => {
            let records = if failed {
                delivery::list_failed(&pool, id).await?
            } else {
                delivery::list_for_campaign(&pool, id).await?
            };
            for r in records {
                println!(
                    "{}\t{}\t{}\t{}",
                    r.subscriber_id,
                    r.status.as_str(),
                    r.sent_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    r.error.unwrap_or_default()
                );
            }
        }
        Command::Queue => {
            println!("{}", queue::count_pending(&pool).await?);
        }
    }

    pool.close().await;
    Ok(())
}

fn print_outcome(id: i64, outcome: DispatchOutcome) {
    match outcome {
        DispatchOutcome::Enqueued { recipients } => {
            println!("campaign {id} sending to {recipients} recipients")
        }
        DispatchOutcome::Finalized(status) => println!("campaign {id} finished as {status}"),
        DispatchOutcome::AlreadySending => println!("campaign {id} is already sending"),
    }
}

fn print_campaign(c: &Campaign) {
    println!(
        "{}\t{}\t{}\t{}/{} sent, {} failed ({}%)",
        c.id,
        c.name,
        c.status,
        c.sent_count,
        c.total_recipients,
        c.failed_count,
        c.progress_percent()
    );
}
