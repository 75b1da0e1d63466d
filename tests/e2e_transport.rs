//! End-to-end transport tests.
//!
//! Providers are driven directly here, without a negotiation in front, to
//! exercise candidate ordering, in-band sequencing and the encrypted layer
//! over real sockets.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jingle::codec::{Candidate, CandidateKind, Description, FileInfo, FileTransfer, SocketTransport, Transport};
use jingle::config::SocketConfig;
use jingle::crypto::{CipherKind, CipherUnit, KeyTransportRegistry, SecureChannel};
use jingle::engine::{EventSink, SessionEvent};
use jingle::protocol::{DataKind, DataPacket, Role, Stanza, NS_IBB, NS_S5B};
use jingle::transport::{dst_hash, ChannelProvider, ContentChannel, InBandProvider, OpenContext, ProviderRegistry};
use jingle::{
    Config, ContentOffer, Jid, Keyring, NegotiationContext, Reason, ReasonCondition, SessionRegistry, SocketProvider,
    StanzaSink,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn jid(s: &str) -> Jid {
    s.parse().unwrap()
}

fn ctx(role: Role, offerer: bool) -> OpenContext {
    OpenContext {
        sid: "session-1".to_string(),
        content: "file".to_string(),
        role,
        offerer,
        initiator: jid("alice@example.org/desk"),
        responder: jid("bob@example.net/laptop"),
    }
}

fn fast_socket() -> SocketConfig {
    SocketConfig {
        connect_timeout_ms: 500,
        accept_timeout_ms: 5_000,
        ..SocketConfig::default()
    }
}

/// Relay one provider's outbound data packets into the other
fn wire(provider: Arc<InBandProvider>, mut rx: mpsc::UnboundedReceiver<Stanza>) {
    tokio::spawn(async move {
        while let Some(stanza) = rx.recv().await {
            if let Stanza::Data(packet) = stanza {
                provider.deliver(packet);
            }
        }
    });
}

#[tokio::test]
async fn test_candidates_dialed_by_priority() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reachable = listener.local_addr().unwrap();

    let descriptor = SocketTransport {
        sid: "s5b-sid".to_string(),
        dst_hash: None,
        candidates: vec![
            Candidate::for_addr("low".to_string(), reachable, CandidateKind::Assisted, 100),
            Candidate::for_addr("high".to_string(), "127.0.0.1:1".parse().unwrap(), CandidateKind::Direct, 100),
        ],
    };
    let order: Vec<&str> = descriptor
        .candidates_by_priority()
        .iter()
        .map(|c| c.cid.as_str())
        .collect();
    assert_eq!(order, vec!["high", "low"]);

    let expected = dst_hash(&descriptor.sid, &ctx(Role::Responder, false));
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut digest = [0u8; 32];
        stream.read_exact(&mut digest).await.unwrap();
        assert_eq!(digest, expected);
        stream.write_all(&[0]).await.unwrap();
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).await.unwrap();
        greeting
    });

    let dialer = SocketProvider::new(fast_socket());
    let mut channel = dialer
        .open(&Transport::Socket(descriptor), &ctx(Role::Responder, false))
        .await
        .unwrap();
    channel.write_all(b"hello").await.unwrap();
    assert_eq!(&server.await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_socket_channel_with_encryption() {
    let offerer = SocketProvider::new(fast_socket());
    let dialer = SocketProvider::new(fast_socket());

    let transport = offerer.prepare(&ctx(Role::Initiator, true)).unwrap();
    assert_eq!(transport.namespace(), NS_S5B);

    let (listening, dialing) = tokio::join!(
        offerer.open(&transport, &ctx(Role::Initiator, true)),
        dialer.open(&transport, &ctx(Role::Responder, false)),
    );

    let sender = CipherUnit::generate(CipherKind::Aes256Gcm).unwrap();
    let receiver = CipherUnit::from_key_and_iv(CipherKind::Aes256Gcm, &sender.key_and_iv()).unwrap();
    let mut tx = ContentChannel::Secure(SecureChannel::new(listening.unwrap(), sender));
    let mut rx = ContentChannel::Secure(SecureChannel::new(dialing.unwrap(), receiver));

    let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
    tx.send(&data).await.unwrap();
    tx.shutdown().await.unwrap();
    assert_eq!(rx.read_to_end().await.unwrap(), data);
}

#[tokio::test]
async fn test_in_band_stream_many_blocks() {
    let (alice_tx, alice_rx) = mpsc::unbounded_channel();
    let (bob_tx, bob_rx) = mpsc::unbounded_channel();
    let alice = Arc::new(InBandProvider::new(Arc::new(alice_tx)).with_block_sizes(512, 512));
    let bob = Arc::new(InBandProvider::new(Arc::new(bob_tx)).with_block_sizes(512, 512));
    wire(Arc::clone(&bob), alice_rx);
    wire(Arc::clone(&alice), bob_rx);

    let transport = alice.prepare(&ctx(Role::Initiator, true)).unwrap();
    let mut receiving = bob.open(&transport, &ctx(Role::Responder, false)).await.unwrap();
    let mut sending = alice.open(&transport, &ctx(Role::Initiator, true)).await.unwrap();

    // Well over a hundred blocks
    let data: Vec<u8> = (0..70_000u32).map(|i| (i % 253) as u8).collect();
    let writer = tokio::spawn(async move {
        sending.write_all(&data).await.unwrap();
        sending.shutdown().await.unwrap();
        data
    });
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), receiving.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, writer.await.unwrap());
}

#[tokio::test]
async fn test_in_band_sequence_gap_closes_stream() {
    let (sink, _out) = mpsc::unbounded_channel::<Stanza>();
    let bob = InBandProvider::new(Arc::new(sink));
    let transport = Transport::InBand(jingle::codec::InBandTransport::new("gap", 4096));
    let mut channel = bob.open(&transport, &ctx(Role::Responder, false)).await.unwrap();
    assert_eq!(bob.open_streams(), 1);

    let packet = |seq: u16, data: &[u8]| DataPacket {
        namespace: NS_IBB.to_string(),
        from: jid("alice@example.org/desk"),
        to: jid("bob@example.net/laptop"),
        sid: "gap".to_string(),
        kind: DataKind::Data {
            seq,
            data: BASE64.encode(data),
        },
    };
    assert!(bob.deliver(packet(0, b"first ")));
    assert!(bob.deliver(packet(2, b"skipped")));

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), channel.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"first ");
}

#[tokio::test]
async fn test_socket_transfer_through_registries() {
    let mut config = Config::default();
    config.negotiation.transports = vec![NS_S5B.to_string()];
    config.socket = fast_socket();

    let (alice_out, alice_out_rx) = mpsc::unbounded_channel();
    let (bob_out, bob_out_rx) = mpsc::unbounded_channel();
    let (alice_events, mut alice_events_rx) = EventSink::channel();
    let (bob_events, mut bob_events_rx) = EventSink::channel();
    let alice = SessionRegistry::from_config(
        jid("alice@example.org/desk"),
        &config,
        Keyring::new(),
        Arc::new(alice_out),
        Arc::new(alice_events),
    )
    .unwrap();
    let bob = SessionRegistry::from_config(
        jid("bob@example.net/laptop"),
        &config,
        Keyring::new(),
        Arc::new(bob_out),
        Arc::new(bob_events),
    )
    .unwrap();
    tokio::spawn({
        let bob = bob.clone();
        async move { bob.run(alice_out_rx).await }
    });
    tokio::spawn({
        let alice = alice.clone();
        async move { alice.run(bob_out_rx).await }
    });

    // Bob asks Alice for a file: Bob creates the content, Alice sends
    let request = ContentOffer::new(Description::FileTransfer(FileTransfer::request(FileInfo::new(
        "report.csv",
        0,
    ))));
    let sid = bob
        .create_outbound_session(jid("alice@example.org/desk"), vec![request])
        .await
        .unwrap();

    let Some(SessionEvent::Incoming(incoming)) = alice_events_rx.recv().await else {
        panic!("expected incoming session");
    };
    incoming.accept().await.unwrap();

    let Some(SessionEvent::ChannelReady { channel: mut tx, .. }) = alice_events_rx.recv().await else {
        panic!("expected alice's channel");
    };
    let Some(SessionEvent::ChannelReady { channel: mut rx, .. }) = bob_events_rx.recv().await else {
        panic!("expected bob's channel");
    };

    tx.send(b"id,value\n1,42\n").await.unwrap();
    tx.shutdown().await.unwrap();
    assert_eq!(rx.read_to_end().await.unwrap(), b"id,value\n1,42\n");

    let snapshot = alice.get(&sid).await.unwrap();
    assert_eq!(snapshot.contents[0].transport, NS_S5B);
    assert!(snapshot.contents[0].blacklist.is_empty());

    bob.shutdown().await;
    let reason = loop {
        match alice_events_rx.recv().await {
            Some(SessionEvent::Terminated { reason, .. }) => break reason,
            Some(_) => continue,
            None => panic!("event stream closed"),
        }
    };
    assert_eq!(reason, ReasonCondition::Gone);
}

/// Registry over a single in-band provider the test can inspect
fn in_band_registry(me: &str) -> (SessionRegistry, Arc<InBandProvider>, mpsc::UnboundedReceiver<Stanza>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (out, out_rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn StanzaSink> = Arc::new(out);
    let provider = Arc::new(InBandProvider::new(Arc::clone(&sink)));
    let providers = ProviderRegistry::new().with(Arc::clone(&provider) as Arc<dyn ChannelProvider>);
    let ctx = NegotiationContext::new(providers, KeyTransportRegistry::new());
    let (events, events_rx) = EventSink::channel();
    let registry = SessionRegistry::new(jid(me), ctx, sink, Arc::new(events));
    (registry, provider, out_rx, events_rx)
}

async fn wait_for_no_streams(provider: &InBandProvider) {
    for _ in 0..100 {
        if provider.open_streams() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} in-band stream(s) left open", provider.open_streams());
}

#[tokio::test]
async fn test_terminate_closes_in_band_streams() {
    let (alice, alice_ibb, alice_out, mut alice_events) = in_band_registry("alice@example.org/desk");
    let (bob, bob_ibb, bob_out, mut bob_events) = in_band_registry("bob@example.net/laptop");
    tokio::spawn({
        let bob = bob.clone();
        async move { bob.run(alice_out).await }
    });
    tokio::spawn({
        let alice = alice.clone();
        async move { alice.run(bob_out).await }
    });

    let offer = ContentOffer::new(Description::FileTransfer(FileTransfer::offer(FileInfo::new("big.iso", 1 << 20))));
    let sid = alice
        .create_outbound_session(jid("bob@example.net/laptop"), vec![offer])
        .await
        .unwrap();
    let Some(SessionEvent::Incoming(incoming)) = bob_events.recv().await else {
        panic!("expected incoming session");
    };
    incoming.accept().await.unwrap();

    let Some(SessionEvent::ChannelReady { channel: _tx, .. }) = alice_events.recv().await else {
        panic!("expected alice's channel");
    };
    let Some(SessionEvent::ChannelReady { channel: mut rx, .. }) = bob_events.recv().await else {
        panic!("expected bob's channel");
    };
    assert_eq!(alice_ibb.open_streams(), 1);
    assert_eq!(bob_ibb.open_streams(), 1);

    // Nothing was sent and the sender never closes its side
    bob.terminate(&sid, Reason::new(ReasonCondition::Cancel)).await.unwrap();
    assert_eq!(bob_ibb.open_streams(), 0);
    wait_for_no_streams(&alice_ibb).await;
    assert!(bob.get(&sid).await.is_none());

    let leftover = tokio::time::timeout(Duration::from_secs(2), rx.read_to_end())
        .await
        .expect("reader still blocked after terminate")
        .unwrap();
    assert!(leftover.is_empty());
}
