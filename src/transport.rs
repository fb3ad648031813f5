// Dialing ldap:// and ldaps:// servers into a stream the connection can own.

use crate::config::TlsSettings;
use crate::tls;
use anyhow::{Context, Result};
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl LdapUrl {
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse "ldap://host[:port][/...]" or "ldaps://host[:port][/...]". IPv6 hosts go in brackets.
pub fn parse_ldap_url(url: &str) -> Result<LdapUrl> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (false, rest)
    } else {
        anyhow::bail!("Invalid LDAP URL scheme, expected ldap:// or ldaps://: {}", url);
    };
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let default_port = if tls { DEFAULT_LDAPS_PORT } else { DEFAULT_LDAP_PORT };

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Unterminated IPv6 address in {}", url))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => anyhow::bail!("Garbage after IPv6 address in {}", url),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        anyhow::bail!("No host in LDAP URL: {}", url);
    }
    let port = match port {
        Some(p) => p
            .parse()
            .with_context(|| format!("Invalid port in URL: {}", url))?,
        None => default_port,
    };
    Ok(LdapUrl {
        tls,
        host: host.to_string(),
        port,
    })
}

/// TCP or TLS connection to an LDAP server.
pub enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connect to `url`; the deadline covers the TCP connect and the TLS handshake.
pub async fn dial(url: &str, settings: &TlsSettings, connect_timeout: Duration) -> Result<LdapStream> {
    let target = parse_ldap_url(url)?;
    tokio::time::timeout(connect_timeout, connect(&target, settings))
        .await
        .map_err(|_| anyhow::anyhow!("Connect to {} timed out after {:?}", target.addr(), connect_timeout))?
}

async fn connect(target: &LdapUrl, settings: &TlsSettings) -> Result<LdapStream> {
    let addr = target.addr();
    let tcp = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let _ = tcp.set_nodelay(true);
    if !target.tls {
        debug!("Connected to {}", addr);
        return Ok(LdapStream::Tcp(tcp));
    }
    let connector = TlsConnector::from(tls::client_config(settings)?);
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", target.host))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {} failed", addr))?;
    info!("TLS connection established to {}", addr);
    Ok(LdapStream::Tls(Box::new(tls_stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber;
    use crate::conn::{Conn, ConnOptions};
    use crate::ldap_protocol::tests::result_message;
    use crate::ldap_protocol::{message_id, APP_DEL_RESPONSE};
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_ldap_url() {
        let url = parse_ldap_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(
            url,
            LdapUrl {
                tls: false,
                host: "127.0.0.1".to_string(),
                port: 1389
            }
        );
        assert_eq!(url.addr(), "127.0.0.1:1389");
    }

    #[test]
    fn test_parse_ldap_url_default_ports() {
        assert_eq!(parse_ldap_url("ldap://ldap.example.com").unwrap().port, 389);
        let url = parse_ldap_url("ldaps://ldap.example.com/dc=example,dc=com").unwrap();
        assert!(url.tls);
        assert_eq!(url.port, 636);
        assert_eq!(url.host, "ldap.example.com");
    }

    #[test]
    fn test_parse_ldap_url_ipv6() {
        let url = parse_ldap_url("ldap://[::1]:1389").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.addr(), "[::1]:1389");
        assert_eq!(parse_ldap_url("ldaps://[::1]").unwrap().port, 636);
        assert!(parse_ldap_url("ldap://[::1").is_err());
    }

    #[test]
    fn test_parse_ldap_url_invalid() {
        assert!(parse_ldap_url("http://127.0.0.1:389").is_err());
        assert!(parse_ldap_url("ldap://:389").is_err());
        assert!(parse_ldap_url("ldap://host:99999").is_err());
        assert!(parse_ldap_url("ldap://host:abc").is_err());
    }

    #[tokio::test]
    async fn test_dial_plain_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let frame = ber::read_frame(&mut socket, &mut buf, 1 << 20).await.unwrap().unwrap();
            let request = ber::decode(&frame).unwrap();
            let reply = result_message(message_id(&request).unwrap(), APP_DEL_RESPONSE, 0, "", "");
            socket.write_all(&reply.serialize()).await.unwrap();
        });

        let url = format!("ldap://127.0.0.1:{}", port);
        let stream = dial(&url, &TlsSettings::default(), Duration::from_secs(5)).await.unwrap();
        assert!(matches!(stream, LdapStream::Tcp(_)));
        let conn = Conn::new(stream, ConnOptions::default());
        assert!(conn.delete("uid=a,dc=example").await.unwrap().is_success());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = format!("ldap://127.0.0.1:{}", port);
        assert!(dial(&url, &TlsSettings::default(), Duration::from_secs(5)).await.is_err());
    }
}
