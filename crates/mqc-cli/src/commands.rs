use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use mqc_core::{ClaimConfig, ClaimRenewal, ClaimRequest, NewMessage, SystemClock};
use mqc_storage::{ClaimedMessages, QueueStore};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum QueueCommand {
    Create(QueueArgs),
    #[command(alias = "rm")]
    Delete(QueueArgs),
    Stats(QueueArgs),
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum MessageCommand {
    Post(MessagePostArgs),
    List(MessageListArgs),
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum ClaimCommand {
    Create(ClaimCreateArgs),
    Get(ClaimTargetArgs),
    Renew(ClaimRenewArgs),
    #[command(alias = "delete")]
    Release(ClaimTargetArgs),
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    pub queue: String,
}

#[derive(Args, Debug)]
pub struct MessagePostArgs {
    pub queue: String,
    #[arg(long)]
    pub ttl: u32,
    /// JSON message bodies
    #[arg(required = true)]
    pub bodies: Vec<String>,
}

#[derive(Args, Debug)]
pub struct MessageListArgs {
    pub queue: String,
    #[arg(long)]
    pub include_claimed: bool,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct ClaimCreateArgs {
    pub queue: String,
    #[arg(long)]
    pub ttl: u32,
    #[arg(long, default_value_t = 0)]
    pub grace: u32,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ClaimTargetArgs {
    pub queue: String,
    pub claim_id: String,
}

#[derive(Args, Debug)]
pub struct ClaimRenewArgs {
    pub queue: String,
    pub claim_id: String,
    #[arg(long)]
    pub ttl: u32,
}

pub struct CommandContext {
    store: QueueStore,
    project: String,
}

impl CommandContext {
    pub fn open(db: &Path, config: ClaimConfig, project: &str) -> Result<Self> {
        let store = QueueStore::open_with(db, config, Arc::new(SystemClock))
            .with_context(|| format!("Failed to open {}", db.display()))?;
        Ok(Self {
            store,
            project: project.to_string(),
        })
    }

    fn project(&self) -> Option<&str> {
        Some(self.project.as_str())
    }
}

pub fn handle_queue_command(ctx: &CommandContext, command: QueueCommand) -> Result<Value> {
    match command {
        QueueCommand::Create(args) => {
            ctx.store.create_queue(&args.queue, ctx.project())?;
            Ok(json!({ "queue": args.queue, "created": true }))
        }
        QueueCommand::Delete(args) => {
            ctx.store.delete_queue(&args.queue, ctx.project())?;
            Ok(json!({ "queue": args.queue, "deleted": true }))
        }
        QueueCommand::Stats(args) => {
            let stats = ctx.store.queue_stats(&args.queue, ctx.project())?;
            Ok(json!({
                "queue": args.queue,
                "messages": { "claimed": stats.claimed, "free": stats.free },
                "expired_claims": stats.expired_claims,
            }))
        }
    }
}

pub fn handle_message_command(ctx: &CommandContext, command: MessageCommand) -> Result<Value> {
    match command {
        MessageCommand::Post(args) => {
            let messages = parse_bodies(&args.bodies, args.ttl)?;
            let ids = ctx
                .store
                .post_messages(&args.queue, ctx.project(), &messages)?;
            Ok(json!({ "resources": ids }))
        }
        MessageCommand::List(args) => {
            let messages = ctx.store.list_messages(
                &args.queue,
                ctx.project(),
                args.include_claimed,
                args.limit,
            )?;
            Ok(json!({ "messages": messages }))
        }
    }
}

pub fn handle_claim_command(ctx: &CommandContext, command: ClaimCommand) -> Result<Value> {
    let claims = ctx.store.claims();
    match command {
        ClaimCommand::Create(args) => {
            let request = ClaimRequest::new(args.ttl, args.grace);
            let (claim_id, messages) =
                claims.create(&args.queue, request, ctx.project(), args.limit)?;
            Ok(json!({ "id": claim_id, "messages": fetch_all(&messages)? }))
        }
        ClaimCommand::Get(args) => {
            let (claim, messages) = claims.get(&args.queue, &args.claim_id, ctx.project())?;
            Ok(json!({
                "id": claim.id,
                "ttl": claim.ttl,
                "age": claim.age,
                "messages": fetch_all(&messages)?,
            }))
        }
        ClaimCommand::Renew(args) => {
            claims.update(
                &args.queue,
                &args.claim_id,
                ClaimRenewal { ttl: args.ttl },
                ctx.project(),
            )?;
            Ok(json!({ "id": args.claim_id, "renewed": true }))
        }
        ClaimCommand::Release(args) => {
            claims.delete(&args.queue, &args.claim_id, ctx.project())?;
            Ok(json!({ "id": args.claim_id, "released": true }))
        }
    }
}

fn fetch_all(messages: &ClaimedMessages<'_>) -> Result<Value> {
    Ok(serde_json::to_value(messages.fetch()?)?)
}

fn parse_bodies(bodies: &[String], ttl: u32) -> Result<Vec<NewMessage>> {
    bodies
        .iter()
        .map(|body| {
            let value: Value = serde_json::from_str(body)
                .with_context(|| format!("Message body is not valid JSON: {body}"))?;
            Ok(NewMessage::new(ttl, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn context(file: &NamedTempFile) -> CommandContext {
        CommandContext::open(file.path(), ClaimConfig::default(), "cli").expect("open")
    }

    #[test]
    fn claim_commands_drive_the_store_end_to_end() {
        let file = NamedTempFile::new().expect("temp db");
        let ctx = context(&file);

        handle_queue_command(
            &ctx,
            QueueCommand::Create(QueueArgs {
                queue: "jobs".to_string(),
            }),
        )
        .expect("create queue");
        handle_message_command(
            &ctx,
            MessageCommand::Post(MessagePostArgs {
                queue: "jobs".to_string(),
                ttl: 120,
                bodies: vec!["{\"n\":1}".to_string(), "[2]".to_string()],
            }),
        )
        .expect("post");

        let created = handle_claim_command(
            &ctx,
            ClaimCommand::Create(ClaimCreateArgs {
                queue: "jobs".to_string(),
                ttl: 60,
                grace: 0,
                limit: Some(1),
            }),
        )
        .expect("claim");
        let claim_id = created["id"].as_str().expect("claim id").to_string();
        assert_eq!(created["messages"].as_array().map(Vec::len), Some(1));

        let fetched = handle_claim_command(
            &ctx,
            ClaimCommand::Get(ClaimTargetArgs {
                queue: "jobs".to_string(),
                claim_id: claim_id.clone(),
            }),
        )
        .expect("get");
        assert_eq!(fetched["ttl"], 60);
        assert_eq!(fetched["messages"], created["messages"]);

        handle_claim_command(
            &ctx,
            ClaimCommand::Release(ClaimTargetArgs {
                queue: "jobs".to_string(),
                claim_id,
            }),
        )
        .expect("release");

        let stats = handle_queue_command(
            &ctx,
            QueueCommand::Stats(QueueArgs {
                queue: "jobs".to_string(),
            }),
        )
        .expect("stats");
        assert_eq!(stats["messages"]["free"], 2);
        assert_eq!(stats["messages"]["claimed"], 0);
    }

    #[test]
    fn invalid_json_body_is_reported() {
        let err = parse_bodies(&["{not json".to_string()], 60).expect_err("invalid");
        assert!(err.to_string().contains("not valid JSON"));
    }
}
