//! DNS stamp (`sdns://`) decoding.
//!
//! See <https://dnscrypt.info/stamps-specifications>. Only the protocols we
//! have a transport for are accepted: plain DNS, DOH, DOT and DOQ.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const PROTO_PLAIN: u8 = 0x00;
const PROTO_DNSCRYPT: u8 = 0x01;
const PROTO_DOH: u8 = 0x02;
const PROTO_DOT: u8 = 0x03;
const PROTO_DOQ: u8 = 0x04;

/// Decoded server stamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stamp {
    Plain {
        addr: String,
    },
    Https {
        /// Bootstrap address, empty when the hostname must be resolved
        addr: String,
        hostname: String,
        path: String,
    },
    Tls {
        addr: String,
        hostname: String,
    },
    Quic {
        addr: String,
        hostname: String,
    },
}

impl Stamp {
    /// Decode a stamp, with or without its `sdns://` prefix
    pub fn parse(stamp: &str) -> Result<Self> {
        let body = stamp.strip_prefix("sdns://").unwrap_or(stamp);
        let bytes = URL_SAFE_NO_PAD
            .decode(body.trim_end_matches('='))
            .context("DNS stamp is not valid base64url")?;

        let (&proto, rest) = bytes.split_first().context("DNS stamp is empty")?;
        let mut reader = Reader { buf: rest };
        // Informal properties (DNSSEC, no logs, no filter); not used for routing
        reader.take(8).context("DNS stamp is missing its properties")?;

        let stamp = match proto {
            PROTO_PLAIN => Stamp::Plain {
                addr: reader.string()?,
            },
            PROTO_DOH => {
                let addr = reader.string()?;
                reader.skip_hashes()?;
                let hostname = reader.string()?;
                let path = reader.string()?;
                Stamp::Https {
                    addr,
                    hostname,
                    path,
                }
            }
            PROTO_DOT | PROTO_DOQ => {
                let addr = reader.string()?;
                reader.skip_hashes()?;
                let hostname = reader.string()?;
                if proto == PROTO_DOT {
                    Stamp::Tls { addr, hostname }
                } else {
                    Stamp::Quic { addr, hostname }
                }
            }
            PROTO_DNSCRYPT => anyhow::bail!("DNSCrypt stamps are not supported"),
            other => anyhow::bail!("Unsupported DNS stamp protocol 0x{:02x}", other),
        };

        if let Stamp::Plain { addr } = &stamp {
            if addr.is_empty() {
                anyhow::bail!("Plain DNS stamp has no address");
            }
        }

        Ok(stamp)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            anyhow::bail!("DNS stamp is truncated");
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Length-prefixed field
    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.take(1)?[0] as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).context("DNS stamp field is not UTF-8")
    }

    /// Variable-length set of certificate hashes; the high bit of each length
    /// byte says another entry follows
    fn skip_hashes(&mut self) -> Result<()> {
        loop {
            let len = self.take(1)?[0];
            self.take((len & 0x7f) as usize)?;
            if len & 0x80 == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.push(s.len() as u8);
        buf.extend_from_slice(s.as_bytes());
    }

    fn encode(bytes: &[u8]) -> String {
        format!("sdns://{}", URL_SAFE_NO_PAD.encode(bytes))
    }

    #[test]
    fn test_plain_stamp() {
        let mut raw = vec![PROTO_PLAIN];
        raw.extend_from_slice(&[0u8; 8]);
        push_str(&mut raw, "8.8.8.8:53");

        let stamp = Stamp::parse(&encode(&raw)).unwrap();
        assert_eq!(
            stamp,
            Stamp::Plain {
                addr: "8.8.8.8:53".to_string()
            }
        );
    }

    #[test]
    fn test_doh_stamp_with_hashes() {
        let mut raw = vec![PROTO_DOH];
        raw.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]);
        push_str(&mut raw, "1.1.1.1");
        // Two hashes: 0x80 marks that another one follows
        raw.push(0x80 | 4);
        raw.extend_from_slice(&[1, 2, 3, 4]);
        raw.push(2);
        raw.extend_from_slice(&[5, 6]);
        push_str(&mut raw, "cloudflare-dns.com");
        push_str(&mut raw, "/dns-query");

        let stamp = Stamp::parse(&encode(&raw)).unwrap();
        assert_eq!(
            stamp,
            Stamp::Https {
                addr: "1.1.1.1".to_string(),
                hostname: "cloudflare-dns.com".to_string(),
                path: "/dns-query".to_string(),
            }
        );
    }

    #[test]
    fn test_dot_and_doq_stamps() {
        for (proto, expect_quic) in [(PROTO_DOT, false), (PROTO_DOQ, true)] {
            let mut raw = vec![proto];
            raw.extend_from_slice(&[0u8; 8]);
            push_str(&mut raw, "");
            raw.push(0);
            push_str(&mut raw, "dns.example");

            let stamp = Stamp::parse(&encode(&raw)).unwrap();
            match stamp {
                Stamp::Quic { addr, hostname } if expect_quic => {
                    assert!(addr.is_empty());
                    assert_eq!(hostname, "dns.example");
                }
                Stamp::Tls { addr, hostname } if !expect_quic => {
                    assert!(addr.is_empty());
                    assert_eq!(hostname, "dns.example");
                }
                other => panic!("unexpected stamp {:?}", other),
            }
        }
    }

    #[test]
    fn test_dnscrypt_rejected() {
        let mut raw = vec![PROTO_DNSCRYPT];
        raw.extend_from_slice(&[0u8; 8]);
        push_str(&mut raw, "1.2.3.4");

        let err = Stamp::parse(&encode(&raw)).unwrap_err();
        assert!(err.to_string().contains("DNSCrypt"));
    }

    #[test]
    fn test_truncated_stamp_rejected() {
        let mut raw = vec![PROTO_DOH];
        raw.extend_from_slice(&[0u8; 8]);
        raw.push(20);
        raw.extend_from_slice(b"short");

        assert!(Stamp::parse(&encode(&raw)).is_err());
        assert!(Stamp::parse("sdns://").is_err());
        assert!(Stamp::parse("sdns://!!!").is_err());
    }
}
