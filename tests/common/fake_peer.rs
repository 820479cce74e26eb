//! Fake peers serving the relay health endpoint.
//!
//! [`FakePeer`] is a plain HTTP wiremock server. [`TlsFakePeer`] is a tiny
//! HTTPS responder built on `tokio-rustls` with an `rcgen` self-signed
//! certificate, plus the matching client trust config.
//!
//! Both record every request so tests can assert the prober never touches
//! anything but the health path.

use replica_sync::HEALTH_CHECK_PATH;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Plain HTTP peer answering `200 OK` on the health path.
pub struct FakePeer {
    server: MockServer,
}

impl FakePeer {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_CHECK_PATH))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Self { server }
    }

    /// Relay address to store in a replica row.
    pub fn relay_address(&self) -> String {
        self.server.uri()
    }

    /// Every path requested so far.
    pub async fn requested_paths(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|req| req.url.path().to_string())
            .collect()
    }

    /// Panics if anything other than the health path was requested.
    pub async fn assert_only_health_checks(&self) {
        for p in self.requested_paths().await {
            assert_eq!(p, HEALTH_CHECK_PATH, "prober requested a non-health path");
        }
    }
}

/// HTTPS peer answering `200 OK` on the health path.
pub struct TlsFakePeer {
    port: u16,
    health_hits: Arc<AtomicUsize>,
    other_hits: Arc<AtomicUsize>,
    client_config: Arc<rustls::ClientConfig>,
    task: JoinHandle<()>,
}

impl TlsFakePeer {
    pub async fn start() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certified = rcgen::generate_simple_self_signed(vec![
            "hello.org".to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let health_hits = Arc::new(AtomicUsize::new(0));
        let other_hits = Arc::new(AtomicUsize::new(0));

        let task = {
            let health_hits = health_hits.clone();
            let other_hits = other_hits.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let acceptor = acceptor.clone();
                    let health_hits = health_hits.clone();
                    let other_hits = other_hits.clone();
                    tokio::spawn(async move {
                        let Ok(tls) = acceptor.accept(stream).await else {
                            return;
                        };
                        let mut reader = BufReader::new(tls);

                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).await.is_err() {
                            return;
                        }
                        // Drain headers.
                        loop {
                            let mut line = String::new();
                            match reader.read_line(&mut line).await {
                                Ok(0) | Err(_) => break,
                                Ok(_) if line == "\r\n" || line == "\n" => break,
                                Ok(_) => {}
                            }
                        }

                        let target = request_line.split_whitespace().nth(1).unwrap_or("");
                        let status = if target == HEALTH_CHECK_PATH {
                            health_hits.fetch_add(1, Ordering::SeqCst);
                            "200 OK"
                        } else {
                            other_hits.fetch_add(1, Ordering::SeqCst);
                            "404 Not Found"
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                            status
                        );
                        let mut tls = reader.into_inner();
                        let _ = tls.write_all(response.as_bytes()).await;
                        let _ = tls.shutdown().await;
                    });
                }
            })
        };

        Self {
            port,
            health_hits,
            other_hits,
            client_config: Arc::new(client_config),
            task,
        }
    }

    pub fn relay_address(&self) -> String {
        format!("https://localhost:{}", self.port)
    }

    /// Trust config that accepts this peer's certificate.
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.client_config.clone()
    }

    pub fn health_hits(&self) -> usize {
        self.health_hits.load(Ordering::SeqCst)
    }

    pub fn other_hits(&self) -> usize {
        self.other_hits.load(Ordering::SeqCst)
    }
}

impl Drop for TlsFakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A TCP listener that accepts connections and never answers.
pub struct HungPeer {
    port: u16,
    task: JoinHandle<()>,
}

impl HungPeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Self { port, task }
    }

    pub fn relay_address(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for HungPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
