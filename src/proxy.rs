use crate::config::Params;
use crate::desync::{set_hop_limit, DesyncHandler};
use crate::packets::PacketHandler;
use anyhow::{bail, ensure, Context, Result};
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_FAILURE: u8 = 0x01;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const LISTEN_BACKLOG: u32 = 128;

pub struct ProxyServer {
    params: Arc<Params>,
    packets: Arc<PacketHandler>,
    desync: Arc<DesyncHandler>,
    listener: TcpListener,
    open: Arc<AtomicUsize>,
    shutdown: Notify,
}

impl ProxyServer {
    pub async fn bind(params: Params) -> Result<Self> {
        let socket = if params.listen.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }
        .context("failed to create listen socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(params.listen)
            .with_context(|| format!("failed to bind {}", params.listen))?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        let packets = Arc::new(PacketHandler::new(params.buffer_size));
        let dp = params.dp.first().cloned().unwrap_or_default();
        let desync = Arc::new(DesyncHandler::new(PacketHandler::new(params.buffer_size), dp));

        Ok(Self {
            params: Arc::new(params),
            packets,
            desync,
            listener,
            open: Arc::new(AtomicUsize::new(0)),
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        info!("SOCKS5 proxy listening on {}", self.listener.local_addr()?);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("stopping accept loop");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    if self.open.load(Ordering::Acquire) >= self.params.max_open {
                        warn!("connection limit reached, dropping {peer}");
                        continue;
                    }
                    self.open.fetch_add(1, Ordering::AcqRel);
                    let guard = OpenGuard(self.open.clone());
                    let conn = ProxyConnection::new(
                        stream,
                        peer,
                        self.params.clone(),
                        self.packets.clone(),
                        self.desync.clone(),
                    );
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = conn.handle().await {
                            debug!("{peer}: {e:#}");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Unblocks the accept loop; in-flight connections drain on their own.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-client SOCKS5 state machine and bidirectional relay.
pub struct ProxyConnection {
    client: TcpStream,
    peer: SocketAddr,
    params: Arc<Params>,
    packets: Arc<PacketHandler>,
    desync: Arc<DesyncHandler>,
}

impl ProxyConnection {
    pub fn new(
        client: TcpStream,
        peer: SocketAddr,
        params: Arc<Params>,
        packets: Arc<PacketHandler>,
        desync: Arc<DesyncHandler>,
    ) -> Self {
        Self {
            client,
            peer,
            params,
            packets,
            desync,
        }
    }

    pub async fn handle(mut self) -> Result<()> {
        trace!("new connection from {}", self.peer);
        let upstream = match timeout(HANDSHAKE_TIMEOUT, self.negotiate()).await {
            Ok(upstream) => upstream?,
            Err(_) => bail!("SOCKS5 handshake timed out"),
        };
        self.relay(upstream).await
    }

    async fn negotiate(&mut self) -> Result<TcpStream> {
        let mut head = [0u8; 2];
        self.client
            .read_exact(&mut head)
            .await
            .context("greeting read failed")?;
        ensure!(
            head[0] == SOCKS_VERSION,
            "unsupported socks version {:#04x}",
            head[0]
        );
        let mut methods = vec![0u8; head[1] as usize];
        self.client
            .read_exact(&mut methods)
            .await
            .context("methods read failed")?;
        ensure!(
            methods.contains(&AUTH_NONE),
            "client offers no open auth method"
        );
        self.client.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

        let mut request = [0u8; 4];
        self.client
            .read_exact(&mut request)
            .await
            .context("request read failed")?;
        ensure!(
            request[0] == SOCKS_VERSION,
            "bad request version {:#04x}",
            request[0]
        );

        // consume the address before rejecting so the failure reply is
        // not clobbered by a reset on close
        let target = self.read_target(request[3]).await?;
        if request[1] != CMD_CONNECT {
            self.reply(REP_FAILURE).await?;
            bail!("unsupported command {:#04x}", request[1]);
        }
        debug!("{} -> {}", self.peer, target);

        let upstream = match TcpStream::connect(target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.reply(REP_FAILURE).await?;
                return Err(e).with_context(|| format!("upstream dial {target} failed"));
            }
        };
        if let Some(ttl) = self.params.def_ttl {
            set_hop_limit(&upstream, u32::from(ttl)).context("failed to set upstream TTL")?;
        }
        // keep desync fragments out of Nagle coalescing
        upstream.set_nodelay(true)?;
        self.reply(REP_SUCCESS).await?;
        Ok(upstream)
    }

    async fn read_target(&mut self, atyp: u8) -> Result<SocketAddr> {
        match atyp {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                self.client.read_exact(&mut addr).await?;
                let port = self.read_port().await?;
                Ok(SocketAddr::from((addr, port)))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.client.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                self.client.read_exact(&mut name).await?;
                let port = self.read_port().await?;
                if !self.params.resolve {
                    self.reply(REP_FAILURE).await?;
                    bail!("domain resolution denied");
                }
                let name = String::from_utf8(name).context("domain is not valid utf-8")?;

                let allow_v6 = self.params.ipv6;
                let resolved = match tokio::net::lookup_host((name.as_str(), port)).await {
                    Ok(mut addrs) => addrs.find(|addr| allow_v6 || addr.is_ipv4()),
                    Err(_) => None,
                };
                match resolved {
                    Some(addr) => Ok(addr),
                    None => {
                        self.reply(REP_FAILURE).await?;
                        bail!("could not resolve {name}");
                    }
                }
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                self.client.read_exact(&mut addr).await?;
                let port = self.read_port().await?;
                if !self.params.ipv6 {
                    self.reply(REP_FAILURE).await?;
                    bail!("ipv6 targets disabled");
                }
                Ok(SocketAddr::from((Ipv6Addr::from(addr), port)))
            }
            other => bail!("unsupported address type {other:#04x}"),
        }
    }

    async fn read_port(&mut self) -> Result<u16> {
        let mut port = [0u8; 2];
        self.client.read_exact(&mut port).await?;
        Ok(u16::from_be_bytes(port))
    }

    async fn reply(&mut self, code: u8) -> Result<()> {
        let reply = [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
        self.client.write_all(&reply).await?;
        self.client.flush().await?;
        Ok(())
    }

    async fn relay(mut self, mut upstream: TcpStream) -> Result<()> {
        // The first client payload goes through the desync pipeline while
        // the upstream socket is still whole; anything the upstream sends
        // before that is forwarded as-is.
        let mut ubuf = vec![0u8; self.params.buffer_size];
        let first = loop {
            tokio::select! {
                read = self.packets.read(&mut self.client) => {
                    break read.context("client read failed")?;
                }
                read = upstream.read(&mut ubuf) => {
                    let n = read.context("upstream read failed")?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.client.write_all(&ubuf[..n]).await?;
                }
            }
        };
        let Some(payload) = first else {
            // client closed before sending anything
            return Ok(());
        };
        self.desync
            .apply(&mut upstream, payload)
            .await
            .context("desync write failed")?;
        trace!("{}: desync phase complete", self.peer);

        let buffer_size = self.params.buffer_size;
        let (client_read, client_write) = self.client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let client_to_upstream = tokio::spawn(forward(client_read, upstream_write, buffer_size));
        let upstream_to_client = tokio::spawn(forward(upstream_read, client_write, buffer_size));
        let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);

        match sent {
            Ok(Ok(bytes)) => trace!("{}: client->upstream closed after {bytes} bytes", self.peer),
            Ok(Err(e)) => debug!("{}: client->upstream failed: {e}", self.peer),
            Err(e) => debug!("{}: client->upstream task failed: {e}", self.peer),
        }
        match received {
            Ok(Ok(bytes)) => trace!("{}: upstream->client closed after {bytes} bytes", self.peer),
            Ok(Err(e)) => debug!("{}: upstream->client failed: {e}", self.peer),
            Err(e) => debug!("{}: upstream->client task failed: {e}", self.peer),
        }
        Ok(())
    }
}

async fn forward<R, W>(mut reader: R, mut writer: W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}
