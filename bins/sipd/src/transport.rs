//! Socket plumbing between interfaces and transaction layers.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, OnceLock, Weak},
};

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use sip_transaction::{
    InterfaceConfig, ListeningPoint, SipListener, StackError, TimerScheduler, TransactionLayer,
    WireSender, WireTarget,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    runtime::Handle,
    sync::mpsc,
};
use tracing::{debug, error, info, trace, warn};

const MAX_DATAGRAM: usize = 65_535;
const MAX_STREAM_BUFFER: usize = 256 * 1024;
const STREAM_QUEUE: usize = 64;

/// [`WireSender`] that writes datagrams on a bound socket.
///
/// Target resolution happens on a spawned task so `send` never blocks the
/// caller, which may be holding transaction state.
pub struct UdpWire {
    socket: Arc<UdpSocket>,
    runtime: Handle,
}

impl UdpWire {
    pub fn new(socket: Arc<UdpSocket>, runtime: Handle) -> Self {
        Self { socket, runtime }
    }
}

impl WireSender for UdpWire {
    fn send(&self, target: WireTarget, payload: Bytes) -> Result<(), StackError> {
        if !target.transport.eq_ignore_ascii_case("UDP") {
            return Err(StackError::Transport(format!(
                "unsupported transport {}",
                target.transport
            )));
        }

        if let Ok(addr) = format!("{}:{}", target.host, target.port).parse::<SocketAddr>() {
            if self.socket.try_send_to(&payload, addr).is_ok() {
                trace!(peer = %addr, bytes = payload.len(), "datagram sent");
                return Ok(());
            }
        }

        let socket = Arc::clone(&self.socket);
        self.runtime.spawn(async move {
            let host = target.host.to_string();
            match socket.send_to(&payload, (host.as_str(), target.port)).await {
                Ok(bytes) => trace!(host = %host, port = target.port, bytes, "datagram sent"),
                Err(e) => warn!(%e, host = %host, port = target.port, "udp send failed"),
            }
        });
        Ok(())
    }
}

/// Open TCP connections of one interface, keyed by peer address.
///
/// Every connection gets a writer task fed through an mpsc queue and a
/// reader task that frames the byte stream into SIP messages for the
/// bound transaction layer.
pub struct TcpConnections {
    writers: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
    layer: OnceLock<Weak<TransactionLayer>>,
    runtime: Handle,
}

impl TcpConnections {
    pub fn new(runtime: Handle) -> Self {
        Self {
            writers: DashMap::new(),
            layer: OnceLock::new(),
            runtime,
        }
    }

    /// Sets the layer that receives inbound frames. Later calls are ignored.
    pub fn bind_layer(&self, layer: &Arc<TransactionLayer>) {
        let _ = self.layer.set(Arc::downgrade(layer));
    }

    pub fn connection_count(&self) -> usize {
        self.writers.len()
    }

    /// Queues `payload` on an open connection to the target, or connects
    /// first when there is none.
    pub fn send(self: &Arc<Self>, target: WireTarget, payload: Bytes) -> Result<(), StackError> {
        if let Some(writer) = self.writer_for(&target) {
            return writer
                .try_send(payload)
                .map_err(|e| StackError::Transport(e.to_string()));
        }

        let connections = Arc::clone(self);
        self.runtime.spawn(async move {
            let host = target.host.to_string();
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let stream = match TcpStream::connect((host, target.port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%e, host = %host, port = target.port, "tcp connect failed");
                    return;
                }
            };
            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(%e, host = %host, port = target.port, "tcp peer address unavailable");
                    return;
                }
            };
            debug!(%peer, "tcp connection opened");
            let writer = connections.attach(stream, peer);
            if writer.send(payload).await.is_err() {
                warn!(%peer, "tcp connection closed before send");
            }
        });
        Ok(())
    }

    /// Exact peer first, then any connection from the same address, so
    /// responses travel back over the connection the request came in on
    /// (RFC 3261 §18.2.2).
    fn writer_for(&self, target: &WireTarget) -> Option<mpsc::Sender<Bytes>> {
        let ip: IpAddr = target
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()?;
        let exact = SocketAddr::new(ip, target.port);
        if let Some(writer) = self.writers.get(&exact) {
            return Some(writer.value().clone());
        }
        self.writers
            .iter()
            .find(|entry| entry.key().ip() == ip)
            .map(|entry| entry.value().clone())
    }

    fn attach(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> mpsc::Sender<Bytes> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(STREAM_QUEUE);
        self.writers.insert(peer, tx.clone());

        self.runtime.spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    warn!(%e, %peer, "tcp write failed");
                    break;
                }
                trace!(%peer, bytes = data.len(), "stream data sent");
            }
        });

        let connections = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        for frame in drain_sip_frames(&mut buf) {
                            connections.deliver(&frame, peer);
                        }
                        if buf.len() > MAX_STREAM_BUFFER {
                            warn!(%peer, bytes = buf.len(), "oversized message, closing connection");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%e, %peer, "tcp read failed");
                        break;
                    }
                }
            }
            connections.writers.remove(&peer);
            debug!(%peer, "tcp connection closed");
        });

        tx
    }

    fn deliver(&self, frame: &Bytes, peer: SocketAddr) {
        trace!(%peer, bytes = frame.len(), "stream message received");
        if let Some(layer) = self.layer.get().and_then(Weak::upgrade) {
            layer.receive(frame, peer);
        }
    }
}

/// Wire shared by every layer of one interface. Messages leave over the
/// transport the target names, whichever layer sends them.
pub struct InterfaceWire {
    udp: Option<UdpWire>,
    tcp: Option<Arc<TcpConnections>>,
}

impl WireSender for InterfaceWire {
    fn send(&self, target: WireTarget, payload: Bytes) -> Result<(), StackError> {
        if target.transport.eq_ignore_ascii_case("UDP") {
            if let Some(udp) = &self.udp {
                return udp.send(target, payload);
            }
        } else if target.transport.eq_ignore_ascii_case("TCP") {
            if let Some(tcp) = &self.tcp {
                return tcp.send(target, payload);
            }
        }
        Err(StackError::Transport(format!(
            "transport {} is not served on this interface",
            target.transport
        )))
    }
}

/// Binds every transport of `interface`, wires one transaction layer per
/// transport to `listener` and spawns the receive loops.
///
/// Transports other than UDP and TCP are a configuration error.
pub async fn serve_interface(
    interface: &InterfaceConfig,
    listener: Weak<dyn SipListener>,
    scheduler: Arc<dyn TimerScheduler>,
) -> Result<Vec<Arc<TransactionLayer>>> {
    let bind = format!("{}:{}", interface.addr, interface.port);
    if let Some(other) = interface
        .transports
        .iter()
        .find(|t| !t.eq_ignore_ascii_case("udp") && !t.eq_ignore_ascii_case("tcp"))
    {
        bail!("unsupported transport {} on interface {}", other, bind);
    }

    let host = interface.addr.trim_start_matches('[').trim_end_matches(']');
    let runtime = Handle::current();

    let socket = if interface.supports("udp") {
        let socket = UdpSocket::bind((host, interface.port))
            .await
            .with_context(|| format!("failed to bind udp {}", bind))?;
        Some(Arc::new(socket))
    } else {
        None
    };
    let stream_listener = if interface.supports("tcp") {
        let listener = TcpListener::bind((host, interface.port))
            .await
            .with_context(|| format!("failed to bind tcp {}", bind))?;
        Some(listener)
    } else {
        None
    };

    let connections = stream_listener
        .as_ref()
        .map(|_| Arc::new(TcpConnections::new(runtime.clone())));
    let wire = Arc::new(InterfaceWire {
        udp: socket
            .as_ref()
            .map(|socket| UdpWire::new(Arc::clone(socket), runtime.clone())),
        tcp: connections.clone(),
    });

    let mut layers = Vec::new();
    if let Some(socket) = socket {
        let point = ListeningPoint::new(interface.addr.clone(), interface.port, "udp");
        let layer = TransactionLayer::new(point, wire.clone(), Arc::clone(&scheduler));
        layer.set_listener(listener.clone());
        tokio::spawn({
            let layer = Arc::clone(&layer);
            let bind = bind.clone();
            async move {
                if let Err(e) = run_udp(socket, layer).await {
                    error!(%e, bind = %bind, "udp listener exited");
                }
            }
        });
        info!(bind = %bind, "listening on udp");
        layers.push(layer);
    }
    if let (Some(stream_listener), Some(connections)) = (stream_listener, connections) {
        let point = ListeningPoint::new(interface.addr.clone(), interface.port, "tcp");
        let layer = TransactionLayer::new(point, wire, scheduler);
        layer.set_listener(listener);
        connections.bind_layer(&layer);
        tokio::spawn(run_tcp(stream_listener, connections));
        info!(bind = %bind, "listening on tcp");
        layers.push(layer);
    }
    Ok(layers)
}

async fn run_udp(socket: Arc<UdpSocket>, layer: Arc<TransactionLayer>) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        if len == 0 {
            continue;
        }
        let payload = Bytes::copy_from_slice(&buf[..len]);
        trace!(peer = %peer, bytes = len, "datagram received");
        layer.receive(&payload, peer);
    }
}

async fn run_tcp(listener: TcpListener, connections: Arc<TcpConnections>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp connection accepted");
                connections.attach(stream, peer);
            }
            Err(e) => error!(%e, "tcp accept error"),
        }
    }
}

/// Splits buffered stream data into complete SIP messages using the
/// Content-Length header. CRLF keep-alives between messages are dropped.
fn drain_sip_frames(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        let blank = buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        let _ = buf.split_to(blank);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            break;
        };
        let needed = head_end + 4 + parse_content_length(&buf[..head_end]).unwrap_or(0);
        if buf.len() < needed {
            break;
        }
        frames.push(buf.split_to(needed).freeze());
    }
    frames
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
