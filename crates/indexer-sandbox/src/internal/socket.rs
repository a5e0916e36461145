//! Host side of `net.Socket` and `tls.TLSSocket`.
//!
//! Connections live in a table keyed by handle; an operation takes its
//! connection out, drives it on the host runtime under the call deadline and
//! puts it back. An operation cut off by the deadline loses the connection,
//! which then reads as closed.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{self, ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::HostEnv;
use crate::net::SocketMeta;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// Outcome of one [`Sockets::read`].
#[derive(Debug, PartialEq, Eq)]
pub enum Read {
    Data(Vec<u8>),
    /// The peer closed its side.
    Eof,
    /// Nothing arrived within the wait.
    Pending,
}

/// Open connections of one engine.
#[derive(Debug, Default)]
pub struct Sockets {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Transport>>,
    tls: std::sync::OnceLock<Arc<ClientConfig>>,
}

impl Sockets {
    /// Opens a connection after the policy's network gate allowed it.
    ///
    /// # Errors
    /// Fails when the policy denies the destination, the connection or the
    /// handshake fails, or the deadline passes first.
    pub fn connect(&self, env: &HostEnv, meta: &SocketMeta, servername: Option<&str>) -> Result<u64, String> {
        let what = format!("connect {}:{}", meta.host, meta.port);
        let transport = env.block_on(&what, async {
            env.policy
                .network()
                .check_socket(meta)
                .await
                .map_err(|reason| format!("connection to {}:{} denied: {reason}", meta.host, meta.port))?;
            let host = meta.host.trim_start_matches('[').trim_end_matches(']');
            let tcp = TcpStream::connect((host, meta.port))
                .await
                .map_err(|e| format!("{what}: {e}"))?;
            if !meta.tls {
                return Ok(Transport::Tcp(tcp));
            }
            let name = ServerName::try_from(servername.unwrap_or(host).to_string())
                .map_err(|e| format!("{what}: {e}"))?;
            let stream = self
                .connector()
                .map_err(|e| format!("{what}: {e}"))?
                .connect(name, tcp)
                .await
                .map_err(|e| format!("{what}: {e}"))?;
            Ok::<_, String>(Transport::Tls(Box::new(stream)))
        })??;

        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(id, transport);
        tracing::debug!(target: crate::TRACE_TARGET_SCRIPT, socket = id, host = %meta.host, port = meta.port, tls = meta.tls, "socket connected");
        Ok(id)
    }

    /// Waits up to `wait` for data.
    ///
    /// # Errors
    /// Fails for unknown handles and transport errors.
    pub fn read(&self, env: &HostEnv, id: u64, wait: Duration) -> Result<Read, String> {
        let mut transport = self.take(id)?;
        let wait = env.deadline.remaining().map_or(wait, |left| left.min(wait));
        let mut buf = vec![0; READ_CHUNK];
        let outcome = env.block_on("socket read", async {
            tokio::time::timeout(wait, transport.read(&mut buf)).await
        });
        let read = match outcome {
            Ok(Ok(Ok(0))) => Read::Eof,
            Ok(Ok(Ok(n))) => {
                buf.truncate(n);
                Read::Data(buf)
            }
            Ok(Ok(Err(e))) => return Err(format!("socket read: {e}")),
            Ok(Err(_)) => Read::Pending,
            Err(e) => return Err(e),
        };
        if read != Read::Eof {
            self.open.lock().insert(id, transport);
        }
        Ok(read)
    }

    /// # Errors
    /// Fails for unknown handles, transport errors and the deadline.
    pub fn write(&self, env: &HostEnv, id: u64, data: &[u8]) -> Result<(), String> {
        let mut transport = self.take(id)?;
        env.block_on("socket write", transport.write_all(data))?
            .map_err(|e| format!("socket write: {e}"))?;
        self.open.lock().insert(id, transport);
        Ok(())
    }

    /// Closes the writing side; reads keep working until the peer closes.
    ///
    /// # Errors
    /// As [`Sockets::write`].
    pub fn end(&self, env: &HostEnv, id: u64) -> Result<(), String> {
        let mut transport = self.take(id)?;
        env.block_on("socket end", transport.shutdown())?
            .map_err(|e| format!("socket end: {e}"))?;
        self.open.lock().insert(id, transport);
        Ok(())
    }

    pub fn close(&self, id: u64) {
        if self.open.lock().remove(&id).is_some() {
            tracing::debug!(target: crate::TRACE_TARGET_SCRIPT, socket = id, "socket closed");
        }
    }

    fn take(&self, id: u64) -> Result<Transport, String> {
        self.open
            .lock()
            .remove(&id)
            .ok_or_else(|| "socket is closed".to_string())
    }

    fn connector(&self) -> Result<TlsConnector, rustls::Error> {
        if let Some(config) = self.tls.get() {
            return Ok(TlsConnector::from(Arc::clone(config)));
        }
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
        let config = self.tls.get_or_init(|| Arc::new(config));
        Ok(TlsConnector::from(Arc::clone(config)))
    }
}
