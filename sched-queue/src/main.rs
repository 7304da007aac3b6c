//! sched-queue - Manage scheduled posts
//!
//! Unix-style tool for adding, inspecting, cancelling and rescheduling
//! posts in the Schedcast queue. It writes to the database only; a running
//! `sched-send` picks the changes up on its next reconcile pass.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libschedcast::logging::LoggingConfig;
use libschedcast::scheduling::{format_relative, parse_schedule};
use libschedcast::types::to_millis;
use libschedcast::{Config, Database, Post, PostStatus, PostStore, Result, SchedcastError, Transition};
use std::io::Read;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "sched-queue")]
#[command(version)]
#[command(about = "Manage scheduled posts")]
#[command(long_about = "\
sched-queue - Manage scheduled posts

DESCRIPTION:
    sched-queue is a Unix-style tool for managing the Schedcast queue.
    Use it to add posts, list them, inspect one, cancel it, or move it
    to a different time. sched-send does the actual posting.

COMMANDS:
    add         Queue a new post
    list        List posts (pending by default)
    show        Show one post in detail
    cancel      Cancel a pending post
    reschedule  Move a pending post to a different time

TIME FORMATS:
    2025-11-20T15:00:00Z    RFC 3339
    \"2025-11-20 15:00\"      UTC
    30m, 2h, +1d, \"in 45m\"  relative to now
    tomorrow, \"next friday 8pm\"

USAGE EXAMPLES:
    # Queue a post for two platforms in two hours
    sched-queue add \"Launch day!\" -p twitter,facebook --at 2h

    # Content from stdin
    echo \"Hello\" | sched-queue add -p twitter --at tomorrow

    # List pending posts in JSON format
    sched-queue list --format json

    # Reschedule a post
    sched-queue reschedule <POST_ID> \"2025-12-01 09:00\"

CONFIGURATION:
    Configuration file: ~/.config/schedcast/config.toml
    Database location: ~/.local/share/schedcast/posts.db

    Override with environment variables:
        SCHEDCAST_CONFIG    - Path to config file
        SCHEDCAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed (e.g. post is no longer pending or is being published)
    2 - Database or configuration error
    3 - Invalid input (unknown post ID, bad time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a new post
    Add {
        /// Post content (read from stdin if omitted)
        content: Option<String>,

        /// Target platforms (repeat or comma-separate)
        #[arg(short, long = "platform", value_delimiter = ',', required = true)]
        platforms: Vec<String>,

        /// When to post (default: now)
        #[arg(short, long, default_value = "now")]
        at: String,

        /// Media URL to attach
        #[arg(short, long)]
        media: Option<String>,
    },

    /// List posts
    List {
        /// pending, posted, failed, cancelled or all
        #[arg(short, long, default_value = "pending")]
        status: String,

        /// Only posts targeting this platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show one post
    Show {
        post_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a pending post
    Cancel { post_id: String },

    /// Reschedule a pending post
    Reschedule {
        post_id: String,

        /// New schedule time (e.g., "tomorrow", "+2h")
        time: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = SchedcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(SchedcastError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if !cli.verbose && std::env::var("SCHEDCAST_LOG_LEVEL").is_err() {
        logging.level = "error".to_string();
    }
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    debug!("Using database {}", config.database_path().display());

    match cli.command {
        Commands::Add {
            content,
            platforms,
            at,
            media,
        } => cmd_add(&db, content, &platforms, &at, media).await,
        Commands::List {
            status,
            platform,
            format,
        } => cmd_list(&db, &status, platform.as_deref(), format.parse()?).await,
        Commands::Show { post_id, format } => cmd_show(&db, &post_id, format.parse()?).await,
        Commands::Cancel { post_id } => cmd_cancel(&db, &post_id).await,
        Commands::Reschedule { post_id, time } => cmd_reschedule(&db, &post_id, &time).await,
    }
}

/// Queue a new post and print its id
async fn cmd_add(
    db: &Database,
    content: Option<String>,
    platforms: &[String],
    at: &str,
    media: Option<String>,
) -> Result<()> {
    let content = match content {
        Some(content) => content,
        None => read_stdin()?,
    };

    let now = Utc::now();
    let scheduled_at = if at.trim().eq_ignore_ascii_case("now") {
        now
    } else {
        parse_schedule(at, now)?
    };

    let mut post = Post::new(content.trim_end().to_string(), platforms, scheduled_at)?;
    if let Some(media) = media {
        post = post.with_media(media);
    }

    let post_id = db.create(&post).await?;
    debug!("Queued {} for {}", post_id, post.scheduled_at);
    println!("{}", post_id);
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .map_err(|e| SchedcastError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
    Ok(buffer)
}

/// List posts, pending by default
async fn cmd_list(
    db: &Database,
    status: &str,
    platform: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let filter = match status {
        "all" => None,
        other => Some(other.parse::<PostStatus>()?),
    };

    let mut posts = db.list(filter).await?;
    if let Some(platform) = platform {
        let platform = libschedcast::types::normalize_platform(platform);
        posts.retain(|p| p.platforms.contains(&platform));
    }

    match format {
        OutputFormat::Json => println!("{}", to_json(&posts)?),
        OutputFormat::Text => output_list_text(&posts, Utc::now()),
    }
    Ok(())
}

/// Output posts as human-readable text
fn output_list_text(posts: &[Post], now: DateTime<Utc>) {
    for post in posts {
        println!(
            "{} | {} | {} | {} | {}",
            post.id,
            post.status,
            post.platforms.join(","),
            truncate_content(&post.content, 50),
            describe_time(post, now)
        );
    }
}

/// When the post fires, or when it finished
fn describe_time(post: &Post, now: DateTime<Utc>) -> String {
    match (post.status, post.posted_at) {
        (PostStatus::Pending, _) if post.is_claimed() => "publishing".to_string(),
        (PostStatus::Pending, _) if post.scheduled_at <= now => "overdue".to_string(),
        (PostStatus::Pending, _) => format_relative(post.scheduled_at, now),
        (_, Some(posted_at)) => format_relative(posted_at, now),
        (_, None) => "-".to_string(),
    }
}

/// Truncate content to max length with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

async fn cmd_show(db: &Database, post_id: &str, format: OutputFormat) -> Result<()> {
    let post = find_post(db, post_id).await?;

    match format {
        OutputFormat::Json => println!("{}", to_json(&post)?),
        OutputFormat::Text => {
            let now = Utc::now();
            println!("ID:         {}", post.id);
            println!("Status:     {}", post.status);
            println!("Platforms:  {}", post.platforms.join(", "));
            println!(
                "Scheduled:  {} ({})",
                post.scheduled_at.to_rfc3339(),
                format_relative(post.scheduled_at, now)
            );
            if let Some(media) = &post.media_url {
                println!("Media:      {}", media);
            }
            if let Some(claimed_at) = post.claimed_at.filter(|_| post.is_pending()) {
                println!("Publishing: since {}", claimed_at.to_rfc3339());
            }
            if let Some(posted_at) = post.posted_at {
                println!("Finished:   {}", posted_at.to_rfc3339());
            }
            println!("Created:    {}", post.created_at.to_rfc3339());
            println!();
            println!("{}", post.content);
        }
    }
    Ok(())
}

async fn cmd_cancel(db: &Database, post_id: &str) -> Result<()> {
    let transition = db.cancel(post_id).await?;
    check_transition(post_id, transition)?;
    println!("Cancelled {}", post_id);
    Ok(())
}

async fn cmd_reschedule(db: &Database, post_id: &str, time: &str) -> Result<()> {
    let scheduled_at = to_millis(parse_schedule(time, Utc::now())?);
    let transition = db.reschedule(post_id, scheduled_at).await?;
    check_transition(post_id, transition)?;
    println!("Rescheduled {} to {}", post_id, scheduled_at.to_rfc3339());
    Ok(())
}

async fn find_post(db: &Database, post_id: &str) -> Result<Post> {
    db.get(post_id)
        .await?
        .ok_or_else(|| SchedcastError::NotFound(post_id.to_string()))
}

fn check_transition(post_id: &str, transition: Transition) -> Result<()> {
    match transition {
        Transition::Applied => Ok(()),
        Transition::NotPending(status) => Err(SchedcastError::NotPending {
            post_id: post_id.to_string(),
            status,
        }),
        Transition::InFlight => Err(SchedcastError::InFlight(post_id.to_string())),
        Transition::NotFound => Err(SchedcastError::NotFound(post_id.to_string())),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| SchedcastError::InvalidInput(format!("Failed to encode JSON: {}", e)))
}
