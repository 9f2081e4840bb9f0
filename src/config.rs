use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const DEFAULT_BUFFER_SIZE: usize = 16384;
pub const DEFAULT_MAX_OPEN: usize = 512;
pub const DEFAULT_FAKE_TTL: u8 = 8;
pub const DEFAULT_OOB_CHAR: u8 = 0x00;

/// Process-wide configuration, immutable once the server is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    pub listen: SocketAddr,
    pub max_open: usize,
    pub buffer_size: usize,
    /// TTL applied to every upstream socket right after connect.
    pub def_ttl: Option<u8>,
    pub ipv6: bool,
    pub resolve: bool,
    pub debug: u8,
    /// Desync policies; the first one applies to every connection.
    pub dp: Vec<DesyncParams>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1080".parse().unwrap(),
            max_open: DEFAULT_MAX_OPEN,
            buffer_size: DEFAULT_BUFFER_SIZE,
            def_ttl: None,
            ipv6: true,
            resolve: true,
            debug: 0,
            dp: vec![],
        }
    }
}

/// Per-flow desync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesyncParams {
    pub parts: Vec<DesyncPart>,
    /// Hop limit for decoy writes in FAKE mode.
    pub ttl: u8,
    /// Decoy payload; the canned TLS ClientHello when absent.
    pub fake_data: Option<Vec<u8>>,
    /// Offset into the decoy payload, resolved against the decoy bytes.
    pub fake_offset: Option<OffsetSpec>,
    pub oob_char: u8,
}

impl Default for DesyncParams {
    fn default() -> Self {
        Self {
            parts: vec![],
            ttl: DEFAULT_FAKE_TTL,
            fake_data: None,
            fake_offset: None,
            oob_char: DEFAULT_OOB_CHAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesyncMode {
    None,
    Split,
    Disorder,
    Oob,
    Disoob,
    Fake,
}

/// One compiled transformation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncPart {
    pub mode: DesyncMode,
    pub spec: OffsetSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFlags {
    pub end: bool,
    pub mid: bool,
    pub rand: bool,
    pub sni: bool,
    pub host: bool,
}

/// A parsed position string: `offset[:repeats[:skip]][+flags]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetSpec {
    pub pos: i64,
    pub repeats: usize,
    pub skip: usize,
    pub flags: OffsetFlags,
}

impl OffsetSpec {
    /// Compiles a position string. Any malformed input yields `None`;
    /// the caller drops the part instead of failing startup.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, flag_str) = match s.split_once('+') {
            Some((base, flags)) => (base, Some(flags)),
            None => (s, None),
        };

        let mut fields = base.split(':');
        let pos: i64 = fields.next()?.parse().ok()?;
        let repeats: usize = match fields.next() {
            Some(r) => r.parse().ok()?,
            None => 1,
        };
        let skip: usize = match fields.next() {
            Some(k) => k.parse().ok()?,
            None => 0,
        };
        if fields.next().is_some() || repeats < 1 {
            return None;
        }

        let mut flags = OffsetFlags::default();
        if let Some(letters) = flag_str {
            if letters.is_empty() {
                return None;
            }
            for ch in letters.chars() {
                match ch {
                    'e' => flags.end = true,
                    'm' => flags.mid = true,
                    'n' => flags.rand = true,
                    's' => flags.sni = true,
                    'h' => flags.host = true,
                    'i' => {} // reserved
                    _ => return None,
                }
            }
        }

        Some(Self {
            pos,
            repeats,
            skip,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_offset() {
        let spec = OffsetSpec::parse("5").unwrap();
        assert_eq!(spec.pos, 5);
        assert_eq!(spec.repeats, 1);
        assert_eq!(spec.skip, 0);
        assert_eq!(spec.flags, OffsetFlags::default());
    }

    #[test]
    fn parses_repeats_and_skip() {
        let spec = OffsetSpec::parse("2:3:4").unwrap();
        assert_eq!((spec.pos, spec.repeats, spec.skip), (2, 3, 4));

        let spec = OffsetSpec::parse("7:2").unwrap();
        assert_eq!((spec.pos, spec.repeats, spec.skip), (7, 2, 0));
    }

    #[test]
    fn parses_flags() {
        let spec = OffsetSpec::parse("1+sn").unwrap();
        assert!(spec.flags.sni && spec.flags.rand);
        assert!(!spec.flags.host && !spec.flags.end && !spec.flags.mid);

        let spec = OffsetSpec::parse("-10+e").unwrap();
        assert_eq!(spec.pos, -10);
        assert!(spec.flags.end);

        // 'i' is reserved but accepted
        assert!(OffsetSpec::parse("3+i").is_some());
    }

    #[test]
    fn negative_offset_allowed() {
        assert_eq!(OffsetSpec::parse("-4").unwrap().pos, -4);
    }

    #[test]
    fn malformed_inputs_are_none() {
        for bad in ["", "abc", "5+", "5+z", "5:x", "1:2:3:4", "5:0", "+s"] {
            assert!(OffsetSpec::parse(bad).is_none(), "accepted {bad:?}");
        }
    }
}
