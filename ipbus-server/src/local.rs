//! A complete bridge running in the current process.
use std::{io, net::SocketAddr};

use tokio::{net::TcpListener, task::JoinSet};

use crate::{
    BusTarget,
    channel::byte_channel,
    error::ServeError,
    forward::{ForwardConfig, Forwarder},
    responder::LinkResponder,
    serial::{AdapterConfig, SerialAdapter},
    server::{Config, Server},
};

/// Capacity of the in-process channels, enough for a few full-size frames.
pub const CHANNEL_CAPACITY: usize = 16 * 1024;

/// Configuration of every stage of a local bridge.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    pub server: Config,
    pub forward: ForwardConfig,
    pub adapter: AdapterConfig,
}

/// The running stages of a local bridge. Dropping it stops all of them.
pub struct LocalBridge {
    local_addr: SocketAddr,
    stages: JoinSet<Result<(), ServeError>>,
}

impl LocalBridge {
    /// The address the server accepts clients on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until the first stage ends and returns its result.
    pub async fn join(mut self) -> Result<(), ServeError> {
        match self.stages.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(err)) => Err(ServeError::Io(io::Error::other(err))),
            None => Ok(()),
        }
    }
}

/// Starts a server, forwarder, serial adapter and emulated hardware for `target`, joined by
/// in-process channels, and serves clients on `listener`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_local_bridge<T>(
    listener: TcpListener,
    target: T,
    config: LocalConfig,
) -> io::Result<LocalBridge>
where
    T: BusTarget + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    let (request_writer, request_reader) = byte_channel(CHANNEL_CAPACITY);
    let (response_writer, response_reader) = byte_channel(CHANNEL_CAPACITY);
    let (link, hardware) = tokio::io::duplex(CHANNEL_CAPACITY);

    let forwarder = Forwarder::new(response_reader, request_writer, config.forward);
    let server = Server::new(forwarder, config.server);
    let adapter = SerialAdapter::new(request_reader, response_writer, link, config.adapter);
    let responder = LinkResponder::new(hardware, target);

    let mut stages = JoinSet::new();
    stages.spawn(async move { server.serve(listener).await });
    stages.spawn(async move { adapter.run().await.map_err(ServeError::from) });
    stages.spawn(async move { responder.run().await.map_err(ServeError::from) });
    log::info!("Local bridge serving on {}", local_addr);
    Ok(LocalBridge { local_addr, stages })
}

#[cfg(test)]
mod test {
    use futures::{SinkExt, StreamExt};
    use ipbus_protocol::{
        ByteOrder, Operation, Packet, PacketHeader, Request, Response, tokio_codec::PacketCodec,
    };
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::memory::MemoryTarget;

    #[tokio::test]
    async fn transactions_cross_all_stages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge =
            spawn_local_bridge(listener, MemoryTarget::new(0, 1024), LocalConfig::default())
                .unwrap();
        let tcp = TcpStream::connect(bridge.local_addr()).await.unwrap();
        let mut client = Framed::new(tcp, PacketCodec::new(64 * 1024));

        let data: Box<[u32]> = (0..255).map(|i| 0x5050_50bc ^ i).collect();
        let requests = [
            Request::new(
                1,
                Operation::Write {
                    address: 0x400,
                    data: data.clone(),
                },
            ),
            Request::new(2, Operation::Read { address: 0x400, words: 255 }),
        ];
        let packet = Packet::new(
            PacketHeader::control(0),
            requests.iter().map(Request::to_frame).collect(),
        );
        client.send((packet, ByteOrder::Big)).await.unwrap();

        let (reply, _) = client.next().await.unwrap().unwrap();
        let read = Response::try_from(reply.frames[1].clone()).unwrap();
        assert_eq!(read.id, 2);
        assert_eq!(read.data, data);
    }
}
