use anyhow::Result;
use clap::Parser;
use fray::{
    DesyncMode, DesyncParams, DesyncPart, OffsetSpec, Params, ProxyServer, DEFAULT_OOB_CHAR,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fray", version)]
#[command(about = "SOCKS5 proxy with DPI desync on the first payload of each connection")]
struct Args {
    /// Listen address
    #[arg(short = 'i', long = "ip", default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Listen port
    #[arg(short = 'p', long = "port", default_value_t = 1080)]
    port: u16,

    /// Max concurrent connections
    #[arg(short = 'c', long = "max-conn", default_value_t = 512)]
    max_conn: usize,

    /// Per-read buffer size
    #[arg(short = 'b', long = "buf-size", default_value_t = 16384)]
    buf_size: usize,

    /// Log verbosity: 0, 1 or 2
    #[arg(short = 'x', long = "debug", default_value_t = 0)]
    debug: u8,

    /// TTL for all outgoing connections
    #[arg(short = 'g', long = "def-ttl")]
    def_ttl: Option<u8>,

    /// Split the first payload at a position: offset[:repeats:skip][+flags]
    #[arg(short = 's', long = "split")]
    split: Vec<String>,

    /// Split and send the halves in reverse order
    #[arg(short = 'd', long = "disorder")]
    disorder: Vec<String>,

    /// Split with an urgent byte between the halves
    #[arg(short = 'o', long = "oob")]
    oob: Vec<String>,

    /// Split in reverse order with an urgent byte between the halves
    #[arg(short = 'q', long = "disoob")]
    disoob: Vec<String>,

    /// Split with a low-TTL decoy between the halves
    #[arg(short = 'f', long = "fake")]
    fake: Vec<String>,

    /// TTL of fake/decoy writes
    #[arg(short = 't', long = "ttl", default_value_t = 8)]
    ttl: u8,

    /// Offset into the decoy payload
    #[arg(short = 'O', long = "fake-offset")]
    fake_offset: Option<String>,

    /// Replace the canned decoy payload
    #[arg(short = 'l', long = "fake-data")]
    fake_data: Option<String>,

    /// Override the OOB byte (decimal, 0x-prefixed hex or one character)
    #[arg(short = 'e', long = "oob-data")]
    oob_data: Option<String>,

    /// Deny domain-name resolution in SOCKS5 requests
    #[arg(short = 'N', long = "no-domain")]
    no_domain: bool,

    /// Deny UDP association (always denied by this build)
    #[arg(short = 'U', long = "no-udp")]
    no_udp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    if args.no_udp {
        info!("UDP associate is always denied");
    }

    let params = build_params(&args);
    let server = Arc::new(ProxyServer::bind(params).await?);

    {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                server.stop();
            }
        });
    }

    server.run().await
}

fn init_logging(debug: u8) {
    let default = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_params(args: &Args) -> Params {
    let mut params = Params {
        listen: SocketAddr::new(args.ip, args.port),
        max_open: args.max_conn,
        buffer_size: args.buf_size,
        def_ttl: args.def_ttl,
        resolve: !args.no_domain,
        debug: args.debug,
        ..Default::default()
    };

    let mut parts = Vec::new();
    for (specs, mode) in [
        (&args.split, DesyncMode::Split),
        (&args.disorder, DesyncMode::Disorder),
        (&args.oob, DesyncMode::Oob),
        (&args.disoob, DesyncMode::Disoob),
        (&args.fake, DesyncMode::Fake),
    ] {
        for raw in specs {
            match OffsetSpec::parse(raw) {
                Some(spec) => parts.push(DesyncPart { mode, spec }),
                None => warn!("ignoring malformed position {raw:?}"),
            }
        }
    }

    if !parts.is_empty() {
        let fake_offset = args.fake_offset.as_deref().and_then(|raw| {
            let spec = OffsetSpec::parse(raw);
            if spec.is_none() {
                warn!("ignoring malformed fake offset {raw:?}");
            }
            spec
        });
        let oob_char = args
            .oob_data
            .as_deref()
            .and_then(|raw| {
                let byte = parse_byte(raw);
                if byte.is_none() {
                    warn!("ignoring malformed OOB byte {raw:?}");
                }
                byte
            })
            .unwrap_or(DEFAULT_OOB_CHAR);

        params.dp.push(DesyncParams {
            parts,
            ttl: args.ttl,
            fake_data: args.fake_data.as_ref().map(|s| s.clone().into_bytes()),
            fake_offset,
            oob_char,
        });
    }
    params
}

fn parse_byte(raw: &str) -> Option<u8> {
    if let Some(hex) = raw.strip_prefix("0x") {
        return u8::from_str_radix(hex, 16).ok();
    }
    if let Ok(value) = raw.parse::<u8>() {
        return Some(value);
    }
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if ch.is_ascii() => Some(ch as u8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_parts_in_flag_order() {
        let args = Args::parse_from([
            "fray", "-s", "5", "-f", "1+s", "-t", "3", "-e", "0x2a", "-g", "64",
        ]);
        let params = build_params(&args);
        assert_eq!(params.def_ttl, Some(64));

        let dp = &params.dp[0];
        assert_eq!(dp.parts.len(), 2);
        assert_eq!(dp.parts[0].mode, DesyncMode::Split);
        assert_eq!(dp.parts[1].mode, DesyncMode::Fake);
        assert_eq!(dp.ttl, 3);
        assert_eq!(dp.oob_char, 0x2a);
    }

    #[test]
    fn malformed_positions_are_dropped() {
        let args = Args::parse_from(["fray", "-s", "zz", "-d", "3"]);
        let params = build_params(&args);
        let dp = &params.dp[0];
        assert_eq!(dp.parts.len(), 1);
        assert_eq!(dp.parts[0].mode, DesyncMode::Disorder);
    }

    #[test]
    fn no_desync_flags_means_no_policy() {
        let args = Args::parse_from(["fray", "-p", "1081", "-N"]);
        let params = build_params(&args);
        assert!(params.dp.is_empty());
        assert!(!params.resolve);
        assert_eq!(params.listen.port(), 1081);
    }

    #[test]
    fn oob_byte_forms() {
        assert_eq!(parse_byte("0"), Some(0));
        assert_eq!(parse_byte("42"), Some(42));
        assert_eq!(parse_byte("0x2a"), Some(0x2a));
        assert_eq!(parse_byte("a"), Some(b'a'));
        assert_eq!(parse_byte(""), None);
        assert_eq!(parse_byte("xyz"), None);
    }
}
