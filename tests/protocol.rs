mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use common::{account, open_store, pool_settings, sync_settings, FakeMessage, FakeRemote};
use mailmirror::client::Client;
use mailmirror::errors::AppError;
use mailmirror::protocol::{
    self, Event, Request, RequestBody, Response, ResponseBody, ServerFrame, PROTOCOL_VERSION,
};
use mailmirror::server::{bind_socket, Server, ServerConfig};

const ACCOUNT: &str = "me@example.com";
const INBOX: &str = "INBOX";
const WAIT: Duration = Duration::from_secs(5);

struct Running {
    dir: TempDir,
    socket: PathBuf,
    remote: FakeRemote,
    server: Arc<Server>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mailmirror.sock");
    let store = open_store(dir.path()).await;
    let remote = FakeRemote::new();
    remote.put(INBOX, (1..=4).map(|uid| FakeMessage::new(uid, 1)).collect());

    let config = ServerConfig {
        socket_path: socket.clone(),
        downloads_dir: dir.path().join("downloads"),
        request_timeout: Duration::from_secs(10),
        sync: sync_settings(),
        pool: pool_settings(),
        initial_sync: false,
        background: false,
    };
    let server = Server::new(vec![account(ACCOUNT)], Arc::new(remote.clone()), store, config);
    let listener = bind_socket(&socket).await.unwrap();
    let task = tokio::spawn(server.clone().serve(listener));

    Running {
        dir,
        socket,
        remote,
        server,
        task,
    }
}

async fn next_event(client: &Client) -> Event {
    timeout(WAIT, client.next_event())
        .await
        .expect("event in time")
        .expect("connection open")
}

type RawRead = FramedRead<tokio::net::unix::OwnedReadHalf, tokio_util::codec::LinesCodec>;
type RawWrite = FramedWrite<tokio::net::unix::OwnedWriteHalf, tokio_util::codec::LinesCodec>;

async fn raw(path: &Path) -> (RawRead, RawWrite) {
    let (read, write) = UnixStream::connect(path).await.unwrap().into_split();
    (
        FramedRead::new(read, protocol::codec()),
        FramedWrite::new(write, protocol::codec()),
    )
}

async fn read_frame(lines: &mut RawRead) -> Option<ServerFrame> {
    timeout(WAIT, lines.next())
        .await
        .expect("frame in time")
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
}

#[test]
fn frames_are_flat_tagged_json() {
    let request = Request {
        id: 3,
        body: RequestBody::QueueDelete {
            account: ACCOUNT.to_string(),
            mailbox: INBOX.to_string(),
            uids: vec![42],
        },
    };
    let json: serde_json::Value = serde_json::to_value(&request).unwrap();
    assert_eq!(json["id"], 3);
    assert_eq!(json["type"], "queue_delete");
    assert_eq!(json["uids"][0], 42);

    let parsed: Request =
        serde_json::from_str(r#"{"id":9,"type":"get_emails","account":"me@example.com"}"#).unwrap();
    match parsed.body {
        RequestBody::GetEmails { mailbox, offset, limit, .. } => {
            assert_eq!(mailbox, INBOX);
            assert_eq!(offset, 0);
            assert_eq!(limit, protocol::DEFAULT_PAGE_SIZE);
        }
        other => panic!("unexpected body {other:?}"),
    }

    let event = ServerFrame::Event(Event::SyncError {
        account: ACCOUNT.to_string(),
        mailbox: INBOX.to_string(),
        message: "boom".to_string(),
    });
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["frame"], "event");
    assert_eq!(json["type"], "sync_error");
    assert!(json.get("id").is_none());
}

#[tokio::test]
async fn handshake_then_requests() {
    let running = start().await;
    let client = Client::connect(&running.socket).await.unwrap();
    assert_eq!(client.server_version(), PROTOCOL_VERSION);

    client.ping().await.unwrap();
    let accounts = client.get_accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].address, ACCOUNT);
    assert_eq!(accounts[0].email_count, 0);
}

#[tokio::test]
async fn mismatched_version_is_rejected() {
    let running = start().await;
    let err = Client::connect_with_version(&running.socket, "0.0.0-old", WAIT)
        .await
        .err()
        .expect("handshake must fail");
    match err {
        AppError::ProtocolVersion { server, client } => {
            assert_eq!(server, PROTOCOL_VERSION);
            assert_eq!(client, "0.0.0-old");
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Raw view: one reply, then the server hangs up.
    let (mut lines, mut sink) = raw(&running.socket).await;
    let hello = Request {
        id: 1,
        body: RequestBody::Hello {
            client_version: "0.0.0-old".to_string(),
        },
    };
    sink.send(serde_json::to_string(&hello).unwrap()).await.unwrap();
    match read_frame(&mut lines).await {
        Some(ServerFrame::Response(resp)) => {
            assert_eq!(resp.id, 1);
            assert!(matches!(resp.body, ResponseBody::VersionMismatch { .. }));
        }
        other => panic!("unexpected frame {other:?}"),
    }
    let ping = Request {
        id: 2,
        body: RequestBody::Ping,
    };
    let _ = sink.send(serde_json::to_string(&ping).unwrap()).await;
    assert!(read_frame(&mut lines).await.is_none());
}

#[tokio::test]
async fn client_rejects_server_with_other_version() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("other.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    // A server that answers every hello as if versions matched.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let mut lines = FramedRead::new(read, protocol::codec());
        let mut sink = FramedWrite::new(write, protocol::codec());
        let line = lines.next().await.unwrap().unwrap();
        let hello: Request = serde_json::from_str(&line).unwrap();
        let reply = ServerFrame::Response(Response {
            id: hello.id,
            body: ResponseBody::Hello {
                server_version: "9.9.9".to_string(),
            },
        });
        sink.send(serde_json::to_string(&reply).unwrap()).await.unwrap();
        // Keep the connection open until the client drops it.
        let _ = lines.next().await;
    });

    let err = Client::connect(&socket).await.err().expect("handshake must fail");
    match err {
        AppError::ProtocolVersion { server, client } => {
            assert_eq!(server, "9.9.9");
            assert_eq!(client, PROTOCOL_VERSION);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let running = start().await;
    let (mut lines, mut sink) = raw(&running.socket).await;
    let ping = Request {
        id: 5,
        body: RequestBody::Ping,
    };
    sink.send(serde_json::to_string(&ping).unwrap()).await.unwrap();

    match read_frame(&mut lines).await {
        Some(ServerFrame::Response(resp)) => {
            assert_eq!(resp.id, 5);
            assert!(matches!(resp.body, ResponseBody::Error { .. }));
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(read_frame(&mut lines).await.is_none());
}

#[tokio::test]
async fn malformed_request_gets_error_with_its_id() {
    let running = start().await;
    let (mut lines, mut sink) = raw(&running.socket).await;
    let hello = Request {
        id: 0,
        body: RequestBody::Hello {
            client_version: PROTOCOL_VERSION.to_string(),
        },
    };
    sink.send(serde_json::to_string(&hello).unwrap()).await.unwrap();
    assert!(matches!(
        read_frame(&mut lines).await,
        Some(ServerFrame::Response(_))
    ));

    sink.send(r#"{"id":17,"type":"no_such_request"}"#.to_string()).await.unwrap();
    match read_frame(&mut lines).await {
        Some(ServerFrame::Response(resp)) => {
            assert_eq!(resp.id, 17);
            assert!(matches!(resp.body, ResponseBody::Error { .. }));
        }
        other => panic!("unexpected frame {other:?}"),
    }

    // Connection survives the bad frame.
    let ping = Request {
        id: 18,
        body: RequestBody::Ping,
    };
    sink.send(serde_json::to_string(&ping).unwrap()).await.unwrap();
    match read_frame(&mut lines).await {
        Some(ServerFrame::Response(resp)) => assert_eq!(resp.body, ResponseBody::Pong),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn sync_is_acknowledged_then_reported_by_events() {
    let running = start().await;
    let client = Client::connect(&running.socket).await.unwrap();

    let already = client.sync(ACCOUNT, INBOX).await.unwrap();
    assert!(!already);

    assert!(matches!(next_event(&client).await, Event::SyncStarted { .. }));
    match next_event(&client).await {
        Event::SyncCompleted { new, total, .. } => assert_eq!((new, total), (4, 4)),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(next_event(&client).await, Event::NewEmails { .. }));

    let (emails, total) = client.get_emails(ACCOUNT, INBOX, 0, 10).await.unwrap();
    assert_eq!(total, 4);
    assert_eq!(emails.len(), 4);
    assert_eq!(emails[0].uid, 1);

    let email = client.get_email(ACCOUNT, INBOX, 2).await.unwrap();
    assert!(email.has_body());
}

#[tokio::test]
async fn events_reach_every_client() {
    let running = start().await;
    let first = Client::connect(&running.socket).await.unwrap();
    let second = Client::connect(&running.socket).await.unwrap();

    first.sync(ACCOUNT, INBOX).await.unwrap();
    assert!(matches!(next_event(&first).await, Event::SyncStarted { .. }));
    assert!(matches!(next_event(&second).await, Event::SyncStarted { .. }));
}

#[tokio::test]
async fn queued_delete_answers_before_remote_work() {
    let running = start().await;
    let client = Client::connect(&running.socket).await.unwrap();
    client.sync(ACCOUNT, INBOX).await.unwrap();
    while !matches!(next_event(&client).await, Event::SyncCompleted { .. }) {}

    let count = client.queue_delete(ACCOUNT, INBOX, &[1, 2]).await.unwrap();
    assert_eq!(count, 2);
    let (_, total) = client.get_emails(ACCOUNT, INBOX, 0, 10).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(running.remote.uids(INBOX).len(), 4);

    let pending = client.pending_ops(Some(ACCOUNT)).await.unwrap();
    assert_eq!(pending.len(), 2);
    let status = client.sync_status(Some(ACCOUNT)).await.unwrap();
    assert_eq!(status[0].pending_ops, 2);

    let report = running.server.drain_queue().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(running.remote.uids(INBOX), vec![3, 4]);
    assert!(client.pending_ops(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn errors_come_back_as_error_responses() {
    let running = start().await;
    let client = Client::connect(&running.socket).await.unwrap();

    let err = client.get_emails("nobody@example.com", INBOX, 0, 10).await.unwrap_err();
    match err {
        AppError::Server(message) => assert!(message.contains("nobody@example.com")),
        other => panic!("unexpected error {other:?}"),
    }
    let err = client.get_email(ACCOUNT, INBOX, 999).await.unwrap_err();
    assert!(matches!(err, AppError::Server(_)));

    // The server keeps serving.
    client.ping().await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let running = start().await;
    let client = Arc::new(Client::connect(&running.socket).await.unwrap());
    running.remote.set_delay(Some(Duration::from_millis(20)));

    let search = {
        let client = client.clone();
        tokio::spawn(async move { client.search(ACCOUNT, INBOX, "Message 3").await })
    };
    let mut pings = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        pings.push(tokio::spawn(async move { client.ping().await }));
    }
    for ping in pings {
        ping.await.unwrap().unwrap();
    }
    let hits = search.await.unwrap().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, 3);
}

#[tokio::test]
async fn shutdown_request_stops_the_server() {
    let running = start().await;
    let client = Client::connect(&running.socket).await.unwrap();
    client.shutdown().await.unwrap();

    let result = timeout(WAIT, running.task).await.expect("server stops in time");
    result.unwrap().unwrap();
    assert!(running.server.shutdown_token().is_cancelled());
    assert!(running.dir.path().exists());
}
