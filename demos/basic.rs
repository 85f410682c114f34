/// PGSLOT=test START_LSN=0/0 cargo run --example basic
use pgwire_logical::{ReplicationClient, ReplicationConfig, ReplicationEvent};
use tracing::{error, info};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = ReplicationConfig {
        port: env("PGPORT", "5432").parse()?,
        start_lsn: env("START_LSN", "0/0").parse()?,
        ..ReplicationConfig::new(
            env("PGHOST", "127.0.0.1"),
            env("PGUSER", "postgres"),
            env("PGDATABASE", "postgres"),
            env("PGSLOT", "test"),
        )
    };
    info!(slot = %cfg.slot, start_lsn = %cfg.start_lsn, "starting");

    let mut repl = ReplicationClient::start(cfg).await?;

    let stop = repl.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    loop {
        match repl.recv().await {
            Ok(Some(ReplicationEvent::TableOperation(op))) => println!("{op}"),
            Ok(Some(ReplicationEvent::ParameterStatus(p))) => info!("{p}"),
            Ok(Some(ReplicationEvent::ServerError(e))) => error!("{e}"),
            Ok(None) => break,
            Err(e) => {
                error!("replication failed: {e}");
                break;
            }
        }
    }

    info!("closed: {:?}", repl.join().await);
    Ok(())
}
