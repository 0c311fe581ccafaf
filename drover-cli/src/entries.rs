//! Built-in worker entries
//!
//! An entry is what a worker process runs once its context is bootstrapped.
//! It sets up listeners and handlers and returns; the process then stays up
//! until the controller terminates it.

use anyhow::{Context, Result};
use drover_cluster::{Connection, Listener, WorkerContext, DEFAULT_BACKLOG};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

/// Worker entry point: context plus the user arguments after the entry name
pub type Entry = fn(WorkerContext, Vec<String>) -> BoxFuture<'static, Result<()>>;

const ENTRIES: &[(&str, Entry)] = &[("echo", echo as Entry), ("ready", ready as Entry)];

pub fn lookup(name: &str) -> Option<Entry> {
    ENTRIES
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|(_, entry)| *entry)
}

pub fn names() -> Vec<&'static str> {
    ENTRIES.iter().map(|(name, _)| *name).collect()
}

/// TCP/unix echo server on a shared socket
///
/// Reports `{"event": "listening", "addr": ...}` once accepting and answers
/// a `"ping"` broadcast with `"pong"`.
fn echo(ctx: WorkerContext, args: Vec<String>) -> BoxFuture<'static, Result<()>> {
    async move {
        let uri = args
            .first()
            .context("echo entry requires a listen URI argument")?;
        let listener = ctx
            .import_socket(uri)
            .await
            .with_context(|| format!("Failed to import {}", uri))?
            .listen(DEFAULT_BACKLOG)?;
        let addr = listener.local_addr()?;
        info!("Echo worker listening on {}", addr);

        let reply = ctx.clone();
        ctx.on_message(move |payload: JsonValue| {
            let reply = reply.clone();
            async move {
                if payload == json!("ping") {
                    let _ = reply.send(json!("pong"));
                }
            }
        });

        tokio::spawn(serve_echo(ctx.clone(), listener));
        if ctx.is_worker() {
            ctx.send(json!({ "event": "listening", "addr": addr.to_string() }))?;
        }
        Ok(())
    }
    .boxed()
}

async fn serve_echo(ctx: WorkerContext, listener: Listener) {
    loop {
        tokio::select! {
            _ = ctx.terminated() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(echo_connection(conn));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            },
        }
    }
    debug!("Echo listener closed");
}

async fn echo_connection(conn: Connection) {
    let (mut reader, mut writer) = tokio::io::split(conn);
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        debug!("Echo connection ended: {}", e);
    }
}

/// Sends `"ready"`, then acknowledges a `"go"` broadcast with `"got go"`
fn ready(ctx: WorkerContext, _args: Vec<String>) -> BoxFuture<'static, Result<()>> {
    async move {
        let reply = ctx.clone();
        ctx.on_message(move |payload: JsonValue| {
            let reply = reply.clone();
            async move {
                if payload == json!("go") {
                    let _ = reply.send(json!("got go"));
                }
            }
        });
        ctx.send(json!("ready"))?;
        Ok(())
    }
    .boxed()
}
