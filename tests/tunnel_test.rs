//! End-to-end tests: a real agent and a real consumer over loopback TCP.

use srctunnel::error::TunnelError;
use srctunnel::fingerprint::Fingerprint;
use srctunnel::resolver::DirectoryResolver;
use srctunnel::sync::FetchRequest;
use srctunnel::tunnel::protocol::{self, FatalCode, Frame, Hello, HelloFlags};
use srctunnel::tunnel::{Agent, AgentConfig, AgentState, TcpDialer};
use srctunnel::watcher::WaitOutcome;
use srctunnel::{BuildParams, RemoteWorkspace, UnitId};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// `app` imports `lib`.
fn sources() -> TempDir {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "app/main.x", "main");
    write(tmp.path(), "app/unit.toml", "imports = [\"lib\"]");
    write(tmp.path(), "lib/util.x", "util");
    tmp
}

struct Consumer {
    workspace: Arc<RemoteWorkspace>,
    addr: String,
    shutdown: CancellationToken,
}

impl Consumer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let workspace = Arc::new(RemoteWorkspace::new(BuildParams::host()));
        let shutdown = CancellationToken::new();
        {
            let workspace = workspace.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { workspace.listen(listener, &shutdown).await });
        }
        Self {
            workspace,
            addr,
            shutdown,
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn start_agent(
    addr: &str,
    root: &Path,
) -> (JoinHandle<srctunnel::Result<()>>, CancellationToken) {
    let state = AgentState::new(Arc::new(DirectoryResolver::new(vec![root.to_path_buf()])));
    let agent = Agent::new(TcpDialer::new(addr), state).with_config(AgentConfig {
        reconnect_delay: Duration::from_millis(50),
        ..AgentConfig::default()
    });
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };
    (handle, shutdown)
}

fn fp(s: &str) -> Fingerprint {
    Fingerprint::of(s.as_bytes())
}

#[tokio::test]
async fn test_fetch_watch_refetch() {
    let src = sources();
    let consumer = Consumer::start().await;
    let (_agent, agent_shutdown) = start_agent(&consumer.addr, src.path());
    let cancel = CancellationToken::new();

    let client = tokio::time::timeout(WAIT, consumer.workspace.client(&cancel))
        .await
        .unwrap()
        .unwrap();
    let app = UnitId::new("app");

    let first = client
        .fetch(
            FetchRequest {
                unit: app.clone(),
                known: BTreeSet::new(),
                params: BuildParams::host(),
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(first.error, None);
    assert_eq!(first.files["app/main.x"], fp("main"));
    assert_eq!(first.files["lib/util.x"], fp("util"));
    assert!(first.contents.contains_key(&fp("main")));
    assert!(first.contents.contains_key(&fp("util")));

    let mut changes = consumer
        .workspace
        .watch(app.clone(), &cancel)
        .await
        .unwrap();
    // Let the agent register its watches.
    tokio::time::sleep(Duration::from_millis(500)).await;
    write(src.path(), "lib/util.x", "util v2");

    let outcome = tokio::time::timeout(WAIT, changes.next_change(&cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Changed);

    let known: BTreeSet<Fingerprint> = first.contents.keys().copied().collect();
    let second = client
        .fetch(
            FetchRequest {
                unit: app,
                known,
                params: BuildParams::host(),
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(second.files["app/main.x"], fp("main"));
    assert_eq!(second.files["lib/util.x"], fp("util v2"));
    assert_eq!(second.contents.len(), 1);
    assert_eq!(second.contents[&fp("util v2")].as_ref(), b"util v2");

    agent_shutdown.cancel();
}

#[tokio::test]
async fn test_old_agent_gets_fatal_and_listener_survives() {
    let src = sources();
    let consumer = Consumer::start().await;

    let mut stale = TcpStream::connect(&consumer.addr).await.unwrap();
    let hello = Hello {
        version: 3,
        flags: HelloFlags::empty(),
        agent: "old-agent".to_string(),
    };
    protocol::write_frame(&mut stale, &hello.encode()).await.unwrap();
    match protocol::read_decoded(&mut stale).await.unwrap() {
        Frame::Fatal(fatal) => {
            assert_eq!(FatalCode::from_u16(fatal.code), Some(FatalCode::VersionMismatch));
            assert!(fatal.message.contains("upgrade the agent"));
        }
        other => panic!("Expected FATAL, got {:?}", other),
    }

    // A current agent is still accepted afterwards.
    let (_agent, agent_shutdown) = start_agent(&consumer.addr, src.path());
    let cancel = CancellationToken::new();
    let units = tokio::time::timeout(WAIT, consumer.workspace.list_units(&cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(units, vec!["app", "lib"]);

    agent_shutdown.cancel();
}

#[tokio::test]
async fn test_transport_loss_fails_in_flight_and_new_session_serves() {
    let src = sources();
    let consumer = Consumer::start().await;
    let cancel = CancellationToken::new();

    let (first_agent, first_shutdown) = start_agent(&consumer.addr, src.path());
    let mut changes = consumer
        .workspace
        .watch(UnitId::new("app"), &cancel)
        .await
        .unwrap();

    first_shutdown.cancel();
    first_agent.await.unwrap().unwrap();

    let err = tokio::time::timeout(WAIT, changes.next_change(&cancel))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_transport(), "unexpected error: {}", err);

    let (_second_agent, second_shutdown) = start_agent(&consumer.addr, src.path());
    let vfs = tokio::time::timeout(WAIT, consumer.workspace.fetch(UnitId::new("app"), &cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vfs.read("lib/util.x").unwrap().as_ref(), b"util");

    second_shutdown.cancel();
}

#[tokio::test]
async fn test_error_report_stops_agent() {
    let src = sources();
    let consumer = Consumer::start().await;
    let cancel = CancellationToken::new();

    let (agent, _agent_shutdown) = start_agent(&consumer.addr, src.path());
    let client = tokio::time::timeout(WAIT, consumer.workspace.client(&cancel))
        .await
        .unwrap()
        .unwrap();

    client
        .report_error("malformed fetch response", &cancel)
        .await
        .unwrap();
    client.close();

    let result = tokio::time::timeout(WAIT, agent).await.unwrap().unwrap();
    assert!(matches!(result, Err(TunnelError::Fatal(_))));
}

#[tokio::test]
async fn test_cancelled_fetch_leaves_session_usable() {
    let src = sources();
    let consumer = Consumer::start().await;
    let (_agent, agent_shutdown) = start_agent(&consumer.addr, src.path());
    let cancel = CancellationToken::new();

    let client = tokio::time::timeout(WAIT, consumer.workspace.client(&cancel))
        .await
        .unwrap()
        .unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let request = FetchRequest {
        unit: UnitId::new("app"),
        known: BTreeSet::new(),
        params: BuildParams::host(),
    };
    assert!(matches!(
        client.fetch(request, &cancelled).await,
        Err(TunnelError::Cancelled)
    ));

    assert_eq!(client.version(&cancel).await.unwrap(), protocol::PROTOCOL_VERSION);
    agent_shutdown.cancel();
}
