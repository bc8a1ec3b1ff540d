// LP2P Linux: rendezvous, secure transport and session host daemon.

mod app;
mod config;
mod crypto;
mod discovery;
mod host;
mod logging;
mod transport;

use std::sync::Arc;

use lp2p_core::Agent;

use crate::crypto::Keypair;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: lp2p-linux [--version] [receive [NICKNAME] | connect NICKNAME MESSAGE]";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// Announce presence only; serve `nickname` from config if set.
    Daemon,
    Receive { nickname: String },
    Connect { nickname: String, message: String },
}

fn parse_args(args: &[String], default_nickname: Option<&str>) -> anyhow::Result<Command> {
    match args {
        [] => Ok(match default_nickname {
            Some(n) => Command::Receive { nickname: n.to_string() },
            None => Command::Daemon,
        }),
        [cmd] if cmd == "receive" => default_nickname
            .map(|n| Command::Receive { nickname: n.to_string() })
            .ok_or_else(|| anyhow::anyhow!("receive needs a nickname\n{USAGE}")),
        [cmd, nickname] if cmd == "receive" => Ok(Command::Receive {
            nickname: nickname.clone(),
        }),
        [cmd, nickname, message @ ..] if cmd == "connect" && !message.is_empty() => Ok(Command::Connect {
            nickname: nickname.clone(),
            message: message.join(" "),
        }),
        _ => anyhow::bail!(USAGE),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("lp2p-linux {}", VERSION);
        return Ok(());
    }

    let cfg = config::load()?;
    logging::init(cfg.log_format);
    let command = parse_args(&args, cfg.nickname.as_deref())?;

    // the core is single-threaded: one runtime thread, one local task set
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(cfg, command))
}

async fn run(cfg: config::Config, command: Command) -> anyhow::Result<()> {
    let keypair = Arc::new(Keypair::generate());
    let advertised = discovery::Advertised::default();
    let directory = discovery::Directory::default();
    tracing::info!(agent = ?keypair.agent_id(), "lp2p agent starting");

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = transport::Engine::new(keypair.clone(), cfg.psk_bytes(), events_tx);

    let agent_id = keypair.agent_id();
    let (disc_port, transport_port) = (cfg.discovery_port, cfg.transport_port);
    let (disc_adv, disc_dir) = (advertised.clone(), directory.clone());
    tokio::spawn(async move {
        if let Err(e) = discovery::run_discovery(agent_id, disc_port, transport_port, disc_adv, disc_dir).await {
            tracing::error!(%e, "discovery stopped");
        }
    });
    let listen_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = listen_engine.listen(transport_port).await {
            tracing::error!(%e, "transport listener stopped");
        }
    });

    let agent = Agent::new(cfg.core(), directory);
    let host = host::Host::new(agent, engine, advertised);
    let node = host.node();
    tokio::task::spawn_local(host.run(events_rx, cfg.tick_interval()));

    let work = async {
        match command {
            Command::Daemon => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Command::Receive { nickname } => app::receive(node, nickname).await,
            Command::Connect { nickname, message } => app::connect(node, nickname, message).await,
        }
    };
    tokio::select! {
        result = work => result,
        signal = shutdown_signal() => {
            tracing::info!("shutting down");
            signal
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn bare_invocation_uses_configured_nickname() {
        assert_eq!(parse_args(&[], None).unwrap(), Command::Daemon);
        assert_eq!(
            parse_args(&[], Some("tv")).unwrap(),
            Command::Receive { nickname: "tv".into() }
        );
    }

    #[test]
    fn receive_and_connect() {
        assert_eq!(
            parse_args(&args(&["receive", "radio"]), Some("tv")).unwrap(),
            Command::Receive { nickname: "radio".into() }
        );
        assert!(parse_args(&args(&["receive"]), None).is_err());
        assert_eq!(
            parse_args(&args(&["connect", "tv", "hello", "there"]), None).unwrap(),
            Command::Connect {
                nickname: "tv".into(),
                message: "hello there".into(),
            }
        );
        assert!(parse_args(&args(&["connect", "tv"]), None).is_err());
        assert!(parse_args(&args(&["proxy"]), None).is_err());
    }
}
