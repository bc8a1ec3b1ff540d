//! Command-line flows on top of a running host: `receive` echoes everything a
//! peer sends, `connect` sends one message and prints the reply.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use lp2p_core::{
    DataChannelInit, DatagramEvent, Error, MessageEvent, Payload, ReceiverOptions, RequestOptions, Session,
    SessionCloseEvent, Transport,
};
use tokio::sync::oneshot;

use crate::host::Node;

/// Beacons arrive every couple of seconds; a fresh agent may not know the peer yet.
const DISCOVERY_RETRIES: u32 = 5;
const DISCOVERY_BACKOFF: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

fn describe(data: &Payload) -> String {
    match data {
        Payload::Text(s) => s.clone(),
        Payload::Binary(b) => format!("<{} bytes>", b.len()),
    }
}

/// Advertise `nickname` and serve every Session until the process stops.
pub async fn receive(node: Node, nickname: String) -> anyhow::Result<()> {
    let receiver = node.agent().receiver(ReceiverOptions::new(nickname.clone()));
    let serve_node = node.clone();
    receiver.on_connection(move |e| serve(&serve_node, e.connection.clone()));
    let started = receiver.start();
    node.wake();
    let first = started.await?;
    tracing::info!(%nickname, session = %first.id(), "first peer connected");
    std::future::pending::<()>().await;
    Ok(())
}

fn serve(node: &Node, session: Session) {
    tracing::info!(
        session = %session.id(),
        peer = session.remote_nickname(),
        "session established"
    );
    session.on_datachannel(|e| {
        let channel = e.channel.clone();
        let echo = channel.clone();
        channel.on_message(move |m: &MessageEvent| {
            println!("[{}] {}", echo.label(), describe(&m.data));
            if let Err(err) = echo.send(m.data.clone()) {
                tracing::warn!(%err, "echo failed");
            }
        });
    });
    session.on_close(|e: &SessionCloseEvent| {
        tracing::info!(session = %e.session.id(), remote = e.remote, "session ended");
    });
    let incoming = session.incoming_transports();
    let node = node.clone();
    tokio::task::spawn_local(async move {
        while let Some(transport) = incoming.next().await {
            echo_datagrams(&transport);
            node.wake();
        }
    });
}

fn echo_datagrams(transport: &Transport) {
    let echo = transport.clone();
    transport.on_datagram(move |d: &DatagramEvent| {
        if let Err(err) = echo.send_datagram(d.data.clone()) {
            tracing::debug!(%err, "datagram echo dropped");
        }
    });
}

/// Connect to `nickname`, send `message` on a fresh channel and wait for the echo.
pub async fn connect(node: Node, nickname: String, message: String) -> anyhow::Result<()> {
    let request = node.agent().request(RequestOptions::new(nickname.clone()));
    let mut attempt = 0;
    let session = loop {
        let pending = request.start();
        node.wake();
        match pending.await {
            Ok(session) => break session,
            Err(Error::PeerUnavailable(reason)) if attempt < DISCOVERY_RETRIES => {
                attempt += 1;
                tracing::info!(%nickname, %reason, attempt, "peer not reachable yet, retrying");
                tokio::time::sleep(DISCOVERY_BACKOFF).await;
            }
            Err(e) => return Err(e.into()),
        }
    };
    tracing::info!(session = %session.id(), "connected");

    let chat = session.create_data_channel("chat", DataChannelInit::default())?;
    let (tx, rx) = oneshot::channel();
    let tx = Rc::new(RefCell::new(Some(tx)));
    chat.on_open(move |e| {
        if let Err(err) = e.channel.send(message.as_str()) {
            tracing::warn!(%err, "send failed");
        }
    });
    chat.on_message(move |m: &MessageEvent| {
        if let Some(tx) = tx.borrow_mut().take() {
            let _ = tx.send(m.data.clone());
        }
    });
    node.wake();

    let outcome = tokio::time::timeout(REPLY_TIMEOUT, rx).await;
    session.close();
    node.wake();
    match outcome {
        Ok(Ok(reply)) => {
            println!("{}", describe(&reply));
            Ok(())
        }
        Ok(Err(_)) => Err(Error::SessionClosed.into()),
        Err(_) => anyhow::bail!("no reply from {nickname} within {REPLY_TIMEOUT:?}"),
    }
}
