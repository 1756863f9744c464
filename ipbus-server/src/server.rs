use std::{io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use ipbus_protocol::{
    Packet, PacketType, Request, Response, error::ReadError, tokio_codec::PacketCodec,
};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinSet,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{Dispatch, error::ServeError};

#[derive(Debug, Clone)]
pub struct Config {
    pub max_packet_size: usize,
    pub read_write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: 64 * 1024,
            read_write_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct Server<D> {
    dispatcher: Arc<D>,
    config: Config,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use ipbus_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .max_packet_size(8192)
///     .rw_timeout(Duration::from_secs(20))
///     .build(my_target);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest packet, in bytes, that this server accepts.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    /// Set the TCP read and write timeout
    pub fn rw_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_write_timeout = timeout;
        self
    }

    /// Build and return the server
    pub fn build<D>(self, dispatcher: D) -> Server<D>
    where
        D: Dispatch + Send + Sync + 'static,
    {
        Server::new(dispatcher, self.config)
    }
}

impl<D> Server<D>
where
    D: Dispatch + Send + Sync + 'static,
{
    pub fn new(dispatcher: D, config: Config) -> Server<D> {
        Server {
            dispatcher: Arc::new(dispatcher),
            config,
        }
    }

    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<(), ServeError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves clients accepted by `listener`, each in its own task.
    ///
    /// Only returns when dispatching fails fatally; all clients are dropped at that point.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServeError> {
        log::info!(
            "Server listening for connections on {}",
            listener.local_addr()?
        );
        let mut clients: JoinSet<(SocketAddr, Result<(), ServeError>)> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        log::info!("New client connection from {}", peer_addr);
                        let dispatcher = self.dispatcher.clone();
                        let config = self.config.clone();
                        clients.spawn(async move {
                            (peer_addr, handle_client(&*dispatcher, &config, tcp).await)
                        });
                    }
                    Err(e) => log::error!("Connection error: {}", e),
                },
                Some(joined) = clients.join_next() => match joined {
                    Ok((peer_addr, Ok(()))) => log::info!("Client {} disconnected", peer_addr),
                    Ok((peer_addr, Err(e))) if e.is_fatal() => {
                        log::error!("Client {}: {}, shutting down", peer_addr, e);
                        return Err(e);
                    }
                    Ok((peer_addr, Err(e))) => log::error!("Client {} error: {}", peer_addr, e),
                    Err(e) => log::error!("Client task failed: {}", e),
                },
            }
        }
    }
}

async fn handle_client<D: Dispatch>(
    dispatcher: &D,
    config: &Config,
    tcp: TcpStream,
) -> Result<(), ServeError> {
    tcp.set_nodelay(true)?;
    let mut framed = Framed::new(tcp, PacketCodec::new(config.max_packet_size));

    loop {
        let (packet, order) = match timeout(config.read_write_timeout, framed.next()).await {
            Err(_) => {
                log::error!("Client read timeout, closing connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(ReadError::IoError(err))))
                if err.kind() == ErrorKind::ConnectionAborted
                    || err.kind() == ErrorKind::ConnectionReset =>
            {
                break;
            } // Client disconnected
            Ok(Some(Err(other))) => return Err(other.into()),
        };
        let reply = process_packet(dispatcher, packet).await?;
        timeout(config.read_write_timeout, framed.send((reply, order)))
            .await
            .map_err(|_| ServeError::Timeout)??;
    }
    Ok(())
}

/// Dispatch every transaction of a packet as one batch and build the reply.
async fn process_packet<D: Dispatch>(dispatcher: &D, packet: Packet) -> Result<Packet, ServeError> {
    if packet.header.kind != PacketType::Control {
        return Err(ReadError::UnsupportedPacketType(packet.header.kind as u8).into());
    }
    let requests = packet
        .frames
        .into_iter()
        .map(Request::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    log::debug!(
        "Received packet {} with {} transactions",
        packet.header.id,
        requests.len()
    );
    for request in &requests {
        log::trace!("Transaction {}: {:?}", request.id, request.op);
    }
    let responses = dispatcher.dispatch(requests).await?;
    for response in responses.iter().filter(|response| !response.is_success()) {
        log::debug!("Transaction {} failed: {}", response.id, response.info);
    }
    Ok(Packet::new(
        packet.header,
        responses.iter().map(Response::to_frame).collect(),
    ))
}
