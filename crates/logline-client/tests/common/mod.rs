// Loopback QUIC event store used by the integration tests.
#![allow(dead_code)]

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use logline_transport::{QuicConnection, QuicServer, TransportConfig};
use logline_wire::{Frame, FrameHeader, Message};
use parking_lot::Mutex;
use quinn::{ReadExactError, RecvStream, SendStream};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{Notify, mpsc};

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub pem: String,
}

pub fn generate_cert() -> Result<TestCert> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .context("generate self-signed cert")?;
    Ok(TestCert {
        cert_der: CertificateDer::from(cert.serialize_der()?),
        key_der: PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der()),
        pem: cert.serialize_pem()?,
    })
}

pub fn write_pem(pem: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().context("temp file")?;
    file.write_all(pem.as_bytes()).context("write pem")?;
    Ok(file)
}

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Initial number of events in the log; event `n` carries payload `event-n`.
    pub events: u64,
    /// When set, every stream must authenticate with this token first.
    pub token: Option<String>,
    /// Close the whole connection after sending this many events.
    pub drop_after: Option<u64>,
}

#[derive(Default)]
struct StoreState {
    log_len: AtomicU64,
    appended: Notify,
    requests: Mutex<Vec<Message>>,
    finished_streams: AtomicUsize,
    connections: AtomicUsize,
}

/// In-process event store that honours the permit protocol.
pub struct TestStore {
    pub addr: SocketAddr,
    pub cert: TestCert,
    server: Arc<QuicServer>,
    state: Arc<StoreState>,
}

impl TestStore {
    pub async fn start(options: StoreOptions) -> Result<Self> {
        let cert = generate_cert()?;
        let server_config = quinn::ServerConfig::with_single_cert(
            vec![cert.cert_der.clone()],
            cert.key_der.clone_key().into(),
        )
        .context("build server config")?;
        let server = Arc::new(QuicServer::bind(
            "127.0.0.1:0".parse()?,
            server_config,
            TransportConfig::default(),
        )?);
        let addr = server.local_addr()?;
        let state = Arc::new(StoreState {
            log_len: AtomicU64::new(options.events),
            ..StoreState::default()
        });

        let accept_server = Arc::clone(&server);
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok(connection) = accept_server.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    connection,
                    options.clone(),
                    Arc::clone(&accept_state),
                ));
            }
        });

        Ok(Self {
            addr,
            cert,
            server,
            state,
        })
    }

    pub fn servers(&self) -> String {
        self.addr.to_string()
    }

    /// Append `count` events; streams parked at the head pick them up.
    pub fn append(&self, count: u64) {
        self.state.log_len.fetch_add(count, Ordering::SeqCst);
        self.state.appended.notify_waiters();
    }

    pub fn requests(&self) -> Vec<Message> {
        self.state.requests.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn finished_streams(&self) -> usize {
        self.state.finished_streams.load(Ordering::SeqCst)
    }

    /// Poll until `ready` holds, failing after five seconds.
    pub async fn wait_until(&self, what: &str, ready: impl Fn(&TestStore) -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !ready(self) {
            if tokio::time::Instant::now() > deadline {
                bail!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl Drop for TestStore {
    fn drop(&mut self) {
        self.server.close();
    }
}

async fn serve_connection(connection: QuicConnection, options: StoreOptions, state: Arc<StoreState>) {
    while let Ok((send, recv)) = connection.accept_bi().await {
        let connection = connection.clone();
        let options = options.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = serve_stream(connection, send, recv, options, state).await {
                tracing::debug!(error = %err, "test store stream ended");
            }
        });
    }
}

async fn serve_stream(
    connection: QuicConnection,
    mut send: SendStream,
    mut recv: RecvStream,
    options: StoreOptions,
    state: Arc<StoreState>,
) -> Result<()> {
    if let Some(expected) = &options.token {
        let auth = read_message(&mut recv).await?;
        if let Some(message) = &auth {
            state.requests.lock().push(message.clone());
        }
        match auth {
            Some(Message::Auth { token, .. }) if &token == expected => {
                write_message(&mut send, Message::Ok).await?;
            }
            _ => {
                write_message(
                    &mut send,
                    Message::Error {
                        message: "invalid token".to_string(),
                    },
                )
                .await?;
                send.finish()?;
                return Ok(());
            }
        }
    }

    let first = read_message(&mut recv)
        .await?
        .context("stream ended before get_events")?;
    state.requests.lock().push(first.clone());
    let Message::GetEvents {
        tracking_token,
        number_of_permits,
    } = first
    else {
        bail!("expected get_events, got {}", first.kind());
    };

    let (permit_tx, mut permit_rx) = mpsc::unbounded_channel();
    let _ = permit_tx.send(number_of_permits);
    let reader_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            match read_message(&mut recv).await {
                Ok(Some(message)) => {
                    reader_state.requests.lock().push(message.clone());
                    if let Message::GetEvents {
                        number_of_permits, ..
                    } = message
                    {
                        let _ = permit_tx.send(number_of_permits);
                    }
                }
                Ok(None) => {
                    reader_state.finished_streams.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                Err(_) => break,
            }
        }
    });

    let mut next = tracking_token.unwrap_or(0);
    let mut permits = 0u64;
    let mut sent = 0u64;
    loop {
        // Park at the head of the log until something is appended or the
        // client finishes its side.
        while next >= state.log_len.load(Ordering::SeqCst) {
            let appended = state.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();
            if next < state.log_len.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = &mut appended => {}
                granted = permit_rx.recv() => match granted {
                    Some(granted) => permits += granted,
                    None => {
                        let _ = send.finish();
                        return Ok(());
                    }
                },
            }
        }
        while permits == 0 {
            match permit_rx.recv().await {
                Some(granted) => permits += granted,
                None => return Ok(()),
            }
        }
        write_message(
            &mut send,
            Message::Event {
                token: next,
                payload: Bytes::from(format!("event-{next}")),
            },
        )
        .await?;
        next += 1;
        permits -= 1;
        sent += 1;
        if options.drop_after == Some(sent) {
            connection.close("test store dropped connection");
            return Ok(());
        }
    }
}

async fn read_message(recv: &mut RecvStream) -> Result<Option<Message>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))?;
    let mut payload = vec![0u8; header.length as usize];
    recv.read_exact(&mut payload).await?;
    let frame = Frame {
        header,
        payload: Bytes::from(payload),
    };
    Ok(Some(Message::decode(frame)?))
}

async fn write_message(send: &mut SendStream, message: Message) -> Result<()> {
    let frame = message.encode()?;
    send.write_all(&frame.encode()).await?;
    Ok(())
}
