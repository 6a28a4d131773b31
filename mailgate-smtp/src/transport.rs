//! Socket transport: a plain or TLS-wrapped stream with reply formatting.

use std::{fmt::Write, fs::File, io::BufReader, sync::Arc};

use ahash::AHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
        crypto::aws_lc_rs::sign::any_supported_type,
        pki_types::{CertificateDer, PrivateKeyDer},
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
    server::TlsStream,
};

use crate::{
    config::TlsContext,
    error::{ConnectionResult, TlsError, TlsResult},
};

#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?,
        })
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version.as_str().map(str::to_string).unwrap_or_default()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.ciphers.suite().as_str().map(str::to_string).unwrap_or_default()
    }
}

pub enum Transport<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: Stream },
    Tls { stream: Box<TlsStream<Stream>> },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport<Stream> {
    pub const fn plain(stream: Stream) -> Self {
        Self::Plain { stream }
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Write one reply followed by CRLF. Replies format to a
    /// stack-allocated buffer; oversized multi-line replies spill to the
    /// heap.
    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        let mut buffer = arrayvec::ArrayString::<512>::new();

        if write!(&mut buffer, "{response}\r\n").is_ok() {
            self.write_all(buffer.as_bytes()).await?;
            return Ok(buffer.len());
        }

        let text = format!("{response}\r\n");
        self.write_all(text.as_bytes()).await?;
        Ok(text.len())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain { stream } => stream.write_all(bytes).await,
            Self::Tls { stream } => stream.write_all(bytes).await,
        }
    }

    pub(crate) async fn receive(&mut self, buf: &mut [u8]) -> ConnectionResult<usize> {
        Ok(match self {
            Self::Plain { stream } => stream.read(buf).await?,
            Self::Tls { stream } => stream.read(buf).await?,
        })
    }

    /// Run the server side of a TLS handshake over the underlying socket.
    /// Only a plain transport can be upgraded.
    pub(crate) async fn upgrade(self, config: Arc<ServerConfig>) -> TlsResult<(Self, TlsInfo)> {
        match self {
            Self::Plain { stream } => {
                let acceptor = TlsAcceptor::from(config);
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;

                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                    },
                    info,
                ))
            }
            Self::Tls { .. } => Err(TlsError::UpgradeFailed(
                "connection is already encrypted".to_string(),
            )),
        }
    }
}

fn load_certs(context: &TlsContext) -> TlsResult<Vec<CertificateDer<'static>>> {
    let open = |path: &std::path::Path| {
        File::open(path).map_err(|e| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source: e,
        })
    };

    rustls_pemfile::certs(&mut BufReader::new(open(&context.certificate)?))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::CertificateLoad {
            path: context.certificate.display().to_string(),
            source: e,
        })
}

fn load_keys(context: &TlsContext) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = context.key.display().to_string();
    let mut reader = BufReader::new(File::open(&context.key).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

fn certified_key(context: &TlsContext) -> TlsResult<Arc<CertifiedKey>> {
    let certs = load_certs(context)?;
    let key = load_keys(context)?;
    let signing = any_supported_type(&key).map_err(|e| TlsError::KeyLoad {
        path: context.key.display().to_string(),
        reason: e.to_string(),
    })?;

    Ok(Arc::new(CertifiedKey::new(certs, signing)))
}

/// Picks a certificate by the SNI servername, falling back to the default
/// identity when the name is absent or unknown.
struct SniResolver {
    default: Arc<CertifiedKey>,
    by_name: AHashMap<String, Arc<CertifiedKey>>,
}

impl core::fmt::Debug for SniResolver {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fmt.debug_struct("SniResolver")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let chosen = client_hello
            .server_name()
            .and_then(|name| self.by_name.get(&name.to_ascii_lowercase()))
            .unwrap_or(&self.default);

        Some(Arc::clone(chosen))
    }
}

/// Build the shared TLS server configuration from the default identity and
/// any per-servername overrides.
pub(crate) fn server_config(
    default: &TlsContext,
    sni: &AHashMap<String, TlsContext>,
) -> TlsResult<Arc<ServerConfig>> {
    let builder = ServerConfig::builder().with_no_client_auth();

    let config = if sni.is_empty() {
        builder.with_single_cert(load_certs(default)?, load_keys(default)?)?
    } else {
        let mut by_name = AHashMap::with_capacity(sni.len());
        for (name, context) in sni {
            by_name.insert(name.to_ascii_lowercase(), certified_key(context)?);
        }

        builder.with_cert_resolver(Arc::new(SniResolver {
            default: certified_key(default)?,
            by_name,
        }))
    };

    Ok(Arc::new(config))
}
