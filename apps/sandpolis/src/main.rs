use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sandpolis_client_core::auth::CredentialTable;
use sandpolis_client_core::cli::{Cli, Command, ConnectArgs, ServeArgs, SnapshotArgs, WatchArgs};
use sandpolis_client_core::config::ClientConfig;
use sandpolis_client_core::metrics;
use sandpolis_client_core::server::{Server, TreeResponder};
use sandpolis_client_core::session::{ErrorCategory, ServerContext, Session, SessionConfig, SessionError};
use sandpolis_client_core::telemetry::logging;
use sandpolis_client_core::transport::tls;
use serde::Serialize;
use state_tree::{AttributeChange, StateTree, SubscriptionError, Timestamp, UpdateRecord, Value};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    let print_metrics = cli.metrics;

    let result = match cli.command {
        Command::Snapshot(args) => snapshot(args).await,
        Command::Watch(args) => watch(args).await,
        Command::Serve(args) => serve(args).await,
    };
    if let Some(err) = result.as_ref().err().and_then(|err| err.downcast_ref::<SessionError>()) {
        eprintln!("{}", hint(err));
    }
    if print_metrics {
        eprint!("{}", metrics::render());
    }
    result
}

fn hint(err: &SessionError) -> &'static str {
    match err.category() {
        ErrorCategory::Unreachable => "could not reach the server; check --server, --port and --tls",
        ErrorCategory::Rejected => "the server rejected the request or credentials",
        ErrorCategory::TimedOut => "the server did not answer in time; try a larger --timeout-ms",
        ErrorCategory::Closed => "the connection closed",
        ErrorCategory::Protocol => "the server sent something this build does not understand",
        ErrorCategory::Caller => "the request was invalid",
    }
}

async fn connect(args: &ConnectArgs) -> Result<Session> {
    let config = args.apply(ClientConfig::from_env());
    let session_config = SessionConfig::default().with_request_timeout(config.request_timeout);
    let session = Session::connect(&config.server, config.port, &config.tls, session_config).await?;
    if let Some((username, password)) = config.credentials() {
        session.login(username, password).await?;
    }
    Ok(session)
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<Timestamp>,
}

async fn snapshot(args: SnapshotArgs) -> Result<()> {
    let session = connect(&args.connect).await?;
    let record = session.request_snapshot(&args.oid).await?;
    session.close().await;

    if args.json {
        let entries: BTreeMap<String, JsonEntry<'_>> = record
            .entries
            .iter()
            .map(|(oid, change)| {
                let entry = JsonEntry {
                    value: change.value.as_ref(),
                    timestamp: change.timestamp,
                };
                (oid.to_string(), entry)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (oid, change) in &record.entries {
            match &change.value {
                Some(value) => println!("{oid} = {value}"),
                None => println!("{oid} (cleared)"),
            }
        }
    }
    Ok(())
}

async fn watch(args: WatchArgs) -> Result<()> {
    let session = connect(&args.connect).await?;
    let mut changes = session.tree().subscribe_to(&args.oid);
    let stream = session.sync(&args.oid)?;
    stream.started().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = session.closed() => break,
            change = changes.recv() => {
                let change = match change {
                    Ok(change) => change,
                    Err(SubscriptionError::Lagged { skipped }) => {
                        eprintln!("missed {skipped} changes; current values follow");
                        for (oid, entry) in session.tree().snapshot(&args.oid)?.entries {
                            if let Some(value) = entry.value {
                                println!("{oid} = {value}");
                            }
                        }
                        continue;
                    }
                    Err(SubscriptionError::Closed) => break,
                };
                match change.value {
                    Some(value) => println!("{} {} = {value}", change.timestamp, change.oid),
                    None => println!("{} {} (cleared)", change.timestamp, change.oid),
                }
            }
        }
    }

    if let Err(err) = stream.close().await {
        tracing::debug!(target = "sandpolis::cli", error = %err, "stream close failed");
    }
    session.close().await;
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let tree = Arc::new(StateTree::new(&args.namespace));
    if !args.assignments.is_empty() {
        let mut seed = UpdateRecord::new();
        for (oid, value) in args.assignments {
            seed.insert(oid, AttributeChange::set(value));
        }
        tree.merge(&seed).context("seeding the tree")?;
    }

    let mut credentials = CredentialTable::new();
    for (username, password) in &args.users {
        credentials.insert(username.clone(), password);
    }

    let acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(tls::acceptor(cert, key)?),
        _ => None,
    };

    let responder = Arc::new(TreeResponder::new(tree, credentials));
    let context = ServerContext::new(responder);
    let config = SessionConfig {
        namespace: args.namespace.clone(),
        ..SessionConfig::server()
    };
    let server = Server::bind(&args.bind, acceptor, context, config).await?;
    eprintln!("listening on {}", server.local_addr()?);

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}
