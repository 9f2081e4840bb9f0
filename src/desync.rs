use crate::config::{DesyncMode, DesyncParams, DesyncPart, OffsetSpec};
use crate::packets::{find_http_host_offset, find_sni_offset, is_tls_client_hello, Packet, PacketHandler};
use rand::Rng;
use socket2::SockRef;
use std::io;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Executes an ordered list of desync parts against the first outbound
/// payload of a connection. Immutable after construction and shared by
/// every connection.
#[derive(Debug)]
pub struct DesyncHandler {
    packets: PacketHandler,
    dp: DesyncParams,
    decoy: Packet,
}

impl DesyncHandler {
    pub fn new(packets: PacketHandler, dp: DesyncParams) -> Self {
        let mut decoy = match &dp.fake_data {
            Some(data) => Packet::owned(data.clone()),
            None => packets.fake_tls(),
        };
        if let Some(spec) = &dp.fake_offset {
            let at = resolve_position(decoy.payload(), spec);
            decoy.advance(at);
        }
        Self { packets, dp, decoy }
    }

    /// Consumes the payload through the configured part list. Writes
    /// stop at the first failure; remaining parts are not attempted.
    pub async fn apply(&self, upstream: &mut TcpStream, packet: Packet) -> io::Result<()> {
        let mut residual = packet;
        for part in &self.dp.parts {
            residual = self.apply_part(upstream, residual, part).await?;
        }
        self.packets.write(upstream, &residual).await
    }

    /// Emits every fragment of one part except the one that would go
    /// out last; that fragment is returned and becomes the input of the
    /// next part, so each payload byte is written exactly once.
    async fn apply_part(
        &self,
        upstream: &mut TcpStream,
        packet: Packet,
        part: &DesyncPart,
    ) -> io::Result<Packet> {
        if part.mode == DesyncMode::None || packet.is_empty() {
            return Ok(packet);
        }

        let spec = &part.spec;
        let base = resolve_position(packet.payload(), spec);
        let total = packet.len();
        trace!(mode = ?part.mode, base, total, "applying desync part");

        let mut fragments = Vec::with_capacity(spec.repeats + 1);
        let mut rest = packet;
        let mut consumed = 0usize;
        for n in 0..spec.repeats {
            let cut = base.saturating_add(n * spec.skip).min(total);
            let (head, tail) = rest.split_at(cut.saturating_sub(consumed));
            consumed += head.len();
            fragments.push(head);
            rest = tail;
        }
        fragments.push(rest);

        if matches!(part.mode, DesyncMode::Disorder | DesyncMode::Disoob) {
            fragments.reverse();
        }

        let withheld = fragments
            .pop()
            .unwrap_or_else(|| Packet::owned(Vec::new()));
        for fragment in &fragments {
            self.packets.write(upstream, fragment).await?;
            match part.mode {
                DesyncMode::Oob | DesyncMode::Disoob => {
                    send_oob(upstream, self.dp.oob_char).await?;
                }
                DesyncMode::Fake => self.write_decoy(upstream).await?,
                _ => {}
            }
        }
        Ok(withheld)
    }

    /// Writes the decoy under a lowered hop limit so it expires before
    /// the real server. The original hop limit is restored before the
    /// next real write, even when the decoy write fails.
    async fn write_decoy(&self, upstream: &mut TcpStream) -> io::Result<()> {
        let prev = hop_limit(upstream)?;
        set_hop_limit(upstream, u32::from(self.dp.ttl))?;
        let wrote = self.packets.write(upstream, &self.decoy).await;
        let restored = set_hop_limit(upstream, prev);
        wrote?;
        restored
    }
}

/// Resolves a part's split position against the payload it applies to.
///
/// Anchor precedence: SNI/HOST (SNI wins on a TLS handshake when both
/// are set), then END, then MID. A bare negative offset counts from the
/// end. An unlocatable SNI/HOST anchor falls back to the payload start.
fn resolve_position(payload: &[u8], spec: &OffsetSpec) -> usize {
    let size = payload.len() as i64;
    let flags = &spec.flags;

    let anchor = if flags.sni || flags.host {
        let want_sni = if flags.sni && flags.host {
            is_tls_client_hello(payload)
        } else {
            flags.sni
        };
        let found = if want_sni {
            find_sni_offset(payload)
        } else {
            find_http_host_offset(payload)
        };
        match found {
            Some(at) => at as i64,
            None => {
                debug!("desync anchor not found in payload, using start");
                0
            }
        }
    } else if flags.end {
        size
    } else if flags.mid {
        size / 2
    } else if spec.pos < 0 {
        size
    } else {
        0
    };

    let mut pos = (anchor + spec.pos).clamp(0, size);
    if flags.rand {
        let jitter = rand::thread_rng().gen_range(-8i64..=8);
        pos = (pos + jitter).clamp(0, size);
    }
    pos as usize
}

fn is_ipv6(stream: &TcpStream) -> io::Result<bool> {
    Ok(stream.local_addr()?.is_ipv6())
}

fn hop_limit(stream: &TcpStream) -> io::Result<u32> {
    let sock = SockRef::from(stream);
    if is_ipv6(stream)? {
        sock.unicast_hops_v6()
    } else {
        sock.ttl()
    }
}

/// Sets the outgoing hop limit on the socket underneath the stream.
pub(crate) fn set_hop_limit(stream: &TcpStream, hops: u32) -> io::Result<()> {
    let sock = SockRef::from(stream);
    if is_ipv6(stream)? {
        sock.set_unicast_hops_v6(hops)
    } else {
        sock.set_ttl(hops)
    }
}

/// Sends one TCP urgent-mode byte.
async fn send_oob(stream: &TcpStream, byte: u8) -> io::Result<()> {
    loop {
        stream.writable().await?;
        let sock = SockRef::from(stream);
        match sock.send_out_of_band(&[byte]) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
