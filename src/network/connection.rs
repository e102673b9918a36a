//! Socket task for one outbound peer
//!
//! Resolves and dials the host, frames the stream with `MessageCodec` and
//! drives the `Peer` from three sources: frames read off the socket,
//! messages the peer queued for sending and commands from the group.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::sink::SinkExt;
use futures::stream::StreamExt;
use log::{debug, info, warn};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::network::codec::MessageCodec;
use crate::network::message::{Message, NetAddress, ServiceFlags};
use crate::network::params::NetworkParams;
use crate::network::peer::{
    Availability, InventoryFilter, Peer, PeerCommand, PeerError, PeerEvent,
};

/// Default time allowed for DNS resolution plus the TCP handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs besides its own channels
#[derive(Clone)]
pub struct Connector {
    params: Arc<NetworkParams>,
    events: mpsc::UnboundedSender<PeerEvent>,
    inventory: Arc<dyn InventoryFilter>,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(
        params: Arc<NetworkParams>,
        events: mpsc::UnboundedSender<PeerEvent>,
        inventory: Arc<dyn InventoryFilter>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            params,
            events,
            inventory,
            connect_timeout,
        }
    }

    /// Run a connection to completion. Always ends with exactly one
    /// `PeerEvent::Disconnected` for `host`.
    pub async fn run(
        &self,
        host: String,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        availability: Arc<Availability>,
        last_block: i32,
    ) {
        let (outbox_tx, mut outbox) = mpsc::unbounded_channel();
        let mut peer = Peer::new(
            host.clone(),
            self.params.clone(),
            outbox_tx,
            self.events.clone(),
            self.inventory.clone(),
            availability,
        );

        let error = match self
            .drive(&mut peer, &mut commands, &mut outbox, last_block)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!("Connection to {} ended: {}", host, e);
                Some(e.to_string())
            }
        };
        peer.disconnected(error);
    }

    async fn connect(&self, host: &str) -> Result<TcpStream, PeerError> {
        let target = with_default_port(host, self.params.port);
        let dial = async {
            let addr = lookup_host(target.as_str())
                .await?
                .next()
                .ok_or_else(|| PeerError::Unresolvable(target.clone()))?;
            Ok::<_, PeerError>(TcpStream::connect(addr).await?)
        };

        match timeout(self.connect_timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Timeout),
        }
    }

    async fn drive(
        &self,
        peer: &mut Peer,
        commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
        outbox: &mut mpsc::UnboundedReceiver<Message>,
        last_block: i32,
    ) -> Result<(), PeerError> {
        let stream = self.connect(peer.host()).await?;
        let remote = stream.peer_addr()?;
        debug!("Connected to {}", remote);

        let framed = Framed::new(stream, MessageCodec::new(self.params.magic_bytes()));
        let (mut writer, mut reader) = framed.split();

        peer.start(
            NetAddress::from_socket(remote, ServiceFlags::empty()),
            last_block,
        );

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(raw)) => peer.handle_payload(&raw.command, &raw.payload)?,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("Peer {} disconnected", peer.host());
                        return Ok(());
                    }
                },
                Some(message) = outbox.recv() => writer.send(message).await?,
                command = commands.recv() => match command {
                    Some(command) => {
                        if !peer.handle_command(command) {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Append the network's default port unless `host` already names one
pub fn with_default_port(host: &str, port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => return format!("[{}]:{}", ip, port),
        Ok(IpAddr::V4(ip)) => return format!("{}:{}", ip, port),
        Err(_) => {}
    }
    match host.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{}:{}", host, port),
    }
}
