//! Shared fixtures for the end-to-end tests.
//!
//! The tests run against a bridge started in the test process. Setting `IPBUS_REMOTE=<host:port>`
//! runs them against a deployed bridge instead; that bridge must serve the fixture address map.
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use ipbus_client::Connection;
use ipbus_protocol::address::{AddressMap, Node};
use ipbus_server::{
    channel::{ByteReader, ByteWriter, byte_channel},
    forward::{ForwardConfig, Forwarder},
    local::{LocalBridge, LocalConfig, spawn_local_bridge},
    memory::MemoryTarget,
    server::{Config, Server},
};
use tokio::{net::TcpListener, runtime::Runtime};

pub const REMOTE_VAR: &str = "IPBUS_REMOTE";

/// Number of memory words behind a local bridge.
pub const MEMORY_WORDS: usize = 0x800;

/// The address map every test uses.
pub fn fixture_map() -> AddressMap {
    AddressMap::builder()
        .node(Node::scalar("REG", 0x0))
        .and_then(|map| map.node(Node::masked("REG_LOWER_MASK", 0x0, 0x0000_ffff)))
        .and_then(|map| map.node(Node::masked("REG_UPPER_MASK", 0x0, 0xffff_0000)))
        .and_then(|map| map.node(Node::block("MEM", 0x1000, 512)))
        .unwrap()
        .build()
}

pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// A bridge the tests connect to.
pub struct Bridge {
    addr: SocketAddr,
    _local: Option<LocalBridge>,
    // dropped last, the stages run on it
    _runtime: Option<Runtime>,
}

impl Bridge {
    /// Starts a local bridge, or refers to the remote one when [`REMOTE_VAR`] is set.
    pub fn start() -> Bridge {
        match std::env::var(REMOTE_VAR) {
            Ok(remote) => Bridge {
                addr: remote.to_socket_addrs().unwrap().next().unwrap(),
                _local: None,
                _runtime: None,
            },
            Err(_) => Bridge::local(LocalConfig::default()),
        }
    }

    /// Starts all bridge stages in this process, serving an emulated memory.
    pub fn local(config: LocalConfig) -> Bridge {
        let runtime = runtime();
        let local = runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spawn_local_bridge(listener, MemoryTarget::new(0x0, MEMORY_WORDS), config).unwrap()
        });
        Bridge {
            addr: local.local_addr(),
            _local: Some(local),
            _runtime: Some(runtime),
        }
    }

    /// Serves clients through a forwarder whose channels end in the test.
    ///
    /// `adapter` receives the reading end of the request channel and the writing end of the
    /// response channel, and plays the serial-facing side.
    pub fn forwarding<F, Fut>(config: ForwardConfig, adapter: F) -> Bridge
    where
        F: FnOnce(ByteReader, ByteWriter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = runtime();
        let addr = runtime.block_on(async {
            let (request_writer, request_reader) = byte_channel(4096);
            let (response_writer, response_reader) = byte_channel(4096);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = Server::new(
                Forwarder::new(response_reader, request_writer, config),
                Config::default(),
            );
            tokio::spawn(async move { server.serve(listener).await });
            tokio::spawn(adapter(request_reader, response_writer));
            addr
        });
        Bridge {
            addr,
            _local: None,
            _runtime: Some(runtime),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connect(&self) -> Connection {
        Connection::builder()
            .timeout(Duration::from_secs(10))
            .connect(self.addr, fixture_map())
            .unwrap()
    }
}
