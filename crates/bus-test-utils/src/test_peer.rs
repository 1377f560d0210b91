//! A raw framed TCP peer.
//!
//! Speaks the wire protocol one frame at a time with no background tasks, so
//! tests can assert on exact envelope sequences (and misbehave on purpose —
//! register twice, stop reading, send oversize headers).

use bus_protocol::{
    DEFAULT_MAX_FRAME_LEN, Envelope, FrameError, actions, read_envelope, write_envelope,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct TestPeer {
    stream: TcpStream,
    pub name: String,
    max_frame_len: usize,
}

impl TestPeer {
    /// Connect and consume the `welcome` envelope; does not register.
    pub async fn connect(addr: SocketAddr) -> TestPeer {
        let stream = TcpStream::connect(addr).await.expect("connect to broker");
        let mut peer = TestPeer {
            stream,
            name: String::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        };
        let welcome = peer.recv().await.expect("welcome envelope");
        assert_eq!(welcome.action, actions::WELCOME);
        peer
    }

    /// Connect, consume `welcome`, register under `name`, and wait for the
    /// `registered` confirmation.
    pub async fn register(addr: SocketAddr, name: &str) -> TestPeer {
        let mut peer = TestPeer::connect(addr).await;
        peer.send_register(name).await;
        let confirmed = peer
            .expect_action(actions::REGISTERED, Duration::from_secs(1))
            .await;
        assert_eq!(
            confirmed.extra.get("service_name").and_then(|v| v.as_str()),
            Some(name)
        );
        peer.name = name.to_owned();
        peer
    }

    /// Send a `register` envelope without waiting for the reply.
    pub async fn send_register(&mut self, name: &str) {
        let env = Envelope::new(actions::REGISTER)
            .with_sender(name)
            .with_data(json!({ "service_name": name }));
        self.send(&env).await;
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        write_envelope(&mut self.stream, envelope, self.max_frame_len)
            .await
            .expect("write envelope");
    }

    /// Write raw bytes (malformed headers, partial frames).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw bytes");
        self.stream.flush().await.expect("flush raw bytes");
    }

    /// Read the next envelope, whatever it is.
    pub async fn recv(&mut self) -> Result<Envelope, FrameError> {
        read_envelope(&mut self.stream, self.max_frame_len).await
    }

    /// Read the next envelope or give up after `deadline`.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Option<Envelope> {
        timeout(deadline, self.recv()).await.ok()?.ok()
    }

    /// Read envelopes until one matches `action`, skipping everything else.
    /// Panics when `deadline` elapses first.
    pub async fn expect_action(&mut self, action: &str, deadline: Duration) -> Envelope {
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline
                .checked_sub(start.elapsed())
                .unwrap_or_else(|| panic!("timed out waiting for '{action}'"));
            match timeout(remaining, self.recv()).await {
                Ok(Ok(envelope)) if envelope.action == action => return envelope,
                // Not the one we're after; keep draining.
                Ok(Ok(_)) => {}
                Ok(Err(e)) => panic!("connection error waiting for '{action}': {e}"),
                Err(_) => panic!("timed out waiting for '{action}'"),
            }
        }
    }

    /// Assert that the stream reaches end-of-stream within `deadline`
    /// (skipping any envelopes still in flight).
    pub async fn expect_eof(&mut self, deadline: Duration) {
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline
                .checked_sub(start.elapsed())
                .unwrap_or_else(|| panic!("timed out waiting for end-of-stream"));
            match timeout(remaining, self.recv()).await {
                Ok(Err(FrameError::Closed | FrameError::UnexpectedEof)) => return,
                Ok(Err(FrameError::Io(_))) => return,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => panic!("unexpected frame error: {e}"),
                Err(_) => panic!("timed out waiting for end-of-stream"),
            }
        }
    }
}
