//! End-to-end tests against a running dispatcher: real Unix socket, real
//! TCP and UDP binds on loopback, test-local ports.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use someip_dispatch::config::DispatcherConfig;
use someip_dispatch::ipc::{
    self, IpcKind, IpcMessage, IpcReturnCode, LENGTH_PREFIX_SIZE,
};
use someip_dispatch::runtime::Runtime;
use someip_dispatch::wire::{Header, Message, MessageType};
use someip_dispatch::ServiceIdentity;

static NEXT_PORT: AtomicU16 = AtomicU16::new(41000);

/// Spin up a dispatcher on test-local ports; returns the socket path.
async fn start_dispatcher() -> PathBuf {
    let port_base = NEXT_PORT.fetch_add(20, Ordering::SeqCst);
    let socket_path = std::env::temp_dir().join(format!(
        "someip-dispatch-test-{}-{}.socket",
        std::process::id(),
        port_base
    ));

    let config = DispatcherConfig::builder()
        .socket_path(&socket_path)
        .tcp_port(port_base)
        .sd_port(port_base + 10)
        .ping_interval(Duration::from_secs(60))
        .build()
        .unwrap();

    tokio::spawn(async move {
        if let Err(e) = Runtime::new(config).run().await {
            panic!("dispatcher died: {e}");
        }
    });

    // Wait for the socket file to appear
    for _ in 0..100 {
        if socket_path.exists() {
            return socket_path;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher did not come up");
}

struct TestClient {
    stream: UnixStream,
    next_request_id: u16,
}

impl TestClient {
    async fn connect(socket_path: &PathBuf) -> Self {
        Self {
            stream: UnixStream::connect(socket_path).await.unwrap(),
            next_request_id: 1,
        }
    }

    async fn send(&mut self, kind: IpcKind, body: Bytes) -> u16 {
        let mut frame = IpcMessage::new(kind, body);
        frame.request_id = self.next_request_id;
        self.next_request_id += 1;
        self.stream.write_all(&frame.encode()).await.unwrap();
        frame.request_id
    }

    /// Read the next frame, transparently answering pings.
    async fn read_frame(&mut self) -> IpcMessage {
        loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            self.stream.read_exact(&mut prefix).await.unwrap();
            let length = u64::from_le_bytes(prefix) as usize;
            let mut body = vec![0u8; length];
            self.stream.read_exact(&mut body).await.unwrap();
            let frame = IpcMessage::decode_body(&body).unwrap();
            if frame.kind == IpcKind::Ping {
                let mut pong = IpcMessage::new(IpcKind::Pong, Bytes::new());
                pong.request_id = frame.request_id;
                self.stream.write_all(&pong.encode()).await.unwrap();
                continue;
            }
            return frame;
        }
    }

    async fn read_frame_of_kind(&mut self, kind: IpcKind) -> IpcMessage {
        loop {
            let frame = self.read_frame().await;
            if frame.kind == kind {
                return frame;
            }
        }
    }

    async fn register(&mut self, identity: ServiceIdentity) -> IpcReturnCode {
        let id = self
            .send(IpcKind::RegisterService, ipc::encode_identity_body(identity))
            .await;
        loop {
            let frame = self.read_frame().await;
            if frame.kind == IpcKind::Answer && frame.request_id == id {
                return frame.return_code;
            }
        }
    }
}

async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test timed out")
}

#[test_log::test(tokio::test)]
async fn fresh_client_gets_registry_push() {
    with_timeout(async {
        let path = start_dispatcher().await;

        let mut provider = TestClient::connect(&path).await;
        let push = provider.read_frame().await;
        assert_eq!(push.kind, IpcKind::ServicesRegistered);
        assert!(ipc::decode_identity_list(&push.body).is_empty());

        let identity = ServiceIdentity::new(0x1234, 1);
        assert_eq!(provider.register(identity).await, IpcReturnCode::Ok);

        // A later client sees the identity in its initial push
        let mut observer = TestClient::connect(&path).await;
        let push = observer.read_frame().await;
        assert_eq!(push.kind, IpcKind::ServicesRegistered);
        assert_eq!(ipc::decode_identity_list(&push.body), vec![identity]);
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn registry_deltas_reach_other_clients() {
    with_timeout(async {
        let path = start_dispatcher().await;

        let mut observer = TestClient::connect(&path).await;
        observer.read_frame().await; // initial push

        let mut provider = TestClient::connect(&path).await;
        provider.read_frame().await;
        let identity = ServiceIdentity::new(0x2222, 3);
        assert_eq!(provider.register(identity).await, IpcReturnCode::Ok);

        let delta = observer.read_frame_of_kind(IpcKind::ServicesRegistered).await;
        assert_eq!(ipc::decode_identity_list(&delta.body), vec![identity]);

        provider
            .send(
                IpcKind::UnregisterService,
                ipc::encode_identity_body(identity),
            )
            .await;
        let delta = observer
            .read_frame_of_kind(IpcKind::ServicesUnregistered)
            .await;
        assert_eq!(ipc::decode_identity_list(&delta.body), vec![identity]);
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn request_and_response_between_local_clients() {
    with_timeout(async {
        let path = start_dispatcher().await;

        let mut provider = TestClient::connect(&path).await;
        provider.read_frame().await;
        let identity = ServiceIdentity::new(0x1234, 1);
        assert_eq!(provider.register(identity).await, IpcReturnCode::Ok);

        let mut requester = TestClient::connect(&path).await;
        requester.read_frame().await;

        let mut request = Message::new(
            Header::new(0x1234, 0x0001, 0x0042, MessageType::Request, 5),
            Bytes::from_static(b"hello"),
        );
        request.instance_id = 1;
        requester
            .send(IpcKind::SendMessage, ipc::encode_message_body(&request))
            .await;

        // Provider receives the request and answers
        let frame = provider_answers(&mut provider).await;
        assert_eq!(frame.payload.as_ref(), b"hello");

        let response = requester.read_frame_of_kind(IpcKind::SendMessage).await;
        let response = ipc::decode_message_body(&response.body).unwrap();
        assert_eq!(response.header.message_type, MessageType::Response);
        assert_eq!(response.header.request_id, 0x0042);
        assert_eq!(response.payload.as_ref(), b"world");
    })
    .await;
}

/// Provider half of the request/response exchange: receive, echo back a
/// Response with payload "world", the mirrored RequestID and the reply-
/// routing identifier from the frame body.
async fn provider_answers(provider: &mut TestClient) -> Message {
    let frame = provider.read_frame_of_kind(IpcKind::SendMessage).await;
    let request = ipc::decode_message_body(&frame.body).unwrap();
    assert_eq!(request.header.message_type, MessageType::Request);
    assert!(request.client_identifier.is_some());

    let mut response = Message::new(
        Header::new(
            request.header.service_id,
            request.header.member_id,
            request.header.request_id,
            MessageType::Response,
            5,
        ),
        Bytes::from_static(b"world"),
    );
    response.instance_id = request.instance_id;
    response.client_identifier = request.client_identifier;
    let mut out = IpcMessage::new(IpcKind::SendMessage, ipc::encode_message_body(&response));
    out.request_id = 99;
    provider.stream.write_all(&out.encode()).await.unwrap();
    request
}

#[test_log::test(tokio::test)]
async fn notifications_fan_out_to_subscribers() {
    with_timeout(async {
        let path = start_dispatcher().await;
        let identity = ServiceIdentity::new(0x1234, 0);

        let mut first = TestClient::connect(&path).await;
        first.read_frame().await;
        let mut second = TestClient::connect(&path).await;
        second.read_frame().await;
        let mut publisher = TestClient::connect(&path).await;
        publisher.read_frame().await;

        first
            .send(
                IpcKind::SubscribeNotification,
                ipc::encode_subscription_body(identity, 0x8001),
            )
            .await;
        second
            .send(
                IpcKind::SubscribeNotification,
                ipc::encode_subscription_body(identity, 0x8001),
            )
            .await;

        // Subscribe carries no answer; let the dispatcher process it
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut event = Message::new(
            Header::new(0x1234, 0x8001, 0, MessageType::Notification, 4),
            Bytes::from_static(b"tick"),
        );
        event.instance_id = 0;
        publisher
            .send(IpcKind::SendMessage, ipc::encode_message_body(&event))
            .await;

        for subscriber in [&mut first, &mut second] {
            let frame = subscriber.read_frame_of_kind(IpcKind::SendMessage).await;
            let event = ipc::decode_message_body(&frame.body).unwrap();
            assert_eq!(event.header.message_type, MessageType::Notification);
            assert_eq!(event.payload.as_ref(), b"tick");
        }
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn unknown_service_request_answered_with_error() {
    with_timeout(async {
        let path = start_dispatcher().await;

        let mut requester = TestClient::connect(&path).await;
        requester.read_frame().await;

        let mut request = Message::new(
            Header::new(0x4444, 0x0002, 0x0099, MessageType::Request, 0),
            Bytes::new(),
        );
        request.instance_id = 0;
        requester
            .send(IpcKind::SendMessage, ipc::encode_message_body(&request))
            .await;

        let frame = requester.read_frame_of_kind(IpcKind::SendMessage).await;
        let reply = ipc::decode_message_body(&frame.body).unwrap();
        assert_eq!(reply.header.message_type, MessageType::Error);
        assert_eq!(reply.header.request_id, 0x0099);
        assert_eq!(reply.header.message_id(), 0x4444_0002);
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn duplicate_registration_from_second_client_refused() {
    with_timeout(async {
        let path = start_dispatcher().await;
        let identity = ServiceIdentity::new(0x1234, 1);

        let mut first = TestClient::connect(&path).await;
        first.read_frame().await;
        assert_eq!(first.register(identity).await, IpcReturnCode::Ok);

        let mut second = TestClient::connect(&path).await;
        second.read_frame().await;
        assert_eq!(second.register(identity).await, IpcReturnCode::Error);
    })
    .await;
}
