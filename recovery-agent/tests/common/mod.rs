//! Shared fixtures: an in-memory node, a recording notifier, scripted
//! failover collaborators, and a temp-dir backed configuration.

#![allow(dead_code)]

use async_trait::async_trait;
use recovery_agent::failover::{RemoteHost, TrafficRouter};
use recovery_agent::node::{NodeRpc, ProcessControl};
use recovery_agent::notify::{Event, Level, Notifier};
use recovery_agent::store::{FsObjectStore, ObjectStore};
use recovery_agent::{Collaborators, Config, DrError, Dispatcher, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// Node that becomes healthy a fixed time after each start
pub struct MockNode {
    running: AtomicBool,
    warm: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    healthy_after: Duration,
    height: AtomicU64,
    height_on_start: Mutex<Option<u64>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

impl MockNode {
    /// A running, healthy node at `height`
    pub fn new(height: u64, healthy_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            warm: AtomicBool::new(true),
            started_at: Mutex::new(None),
            healthy_after,
            height: AtomicU64::new(height),
            height_on_start: Mutex::new(None),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        })
    }

    /// Height the node reports after its next start
    pub fn set_height_on_start(&self, height: u64) {
        *self.height_on_start.lock().unwrap() = Some(height);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for MockNode {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(h) = *self.height_on_start.lock().unwrap() {
            self.height.store(h, Ordering::SeqCst);
        }
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.warm.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.running())
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn block_number(&self) -> Result<u64> {
        if !self.running() {
            return Err(DrError::Rpc("connection refused".into()));
        }
        let ready = self.warm.load(Ordering::SeqCst)
            || self
                .started_at
                .lock()
                .unwrap()
                .is_some_and(|t| t.elapsed() >= self.healthy_after);
        if ready {
            Ok(self.height.load(Ordering::SeqCst))
        } else {
            Err(DrError::Rpc("starting up".into()))
        }
    }

    async fn peer_count(&self) -> Result<u64> {
        Ok(5)
    }

    async fn syncing(&self) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn levels(&self) -> Vec<Level> {
        self.events.lock().unwrap().iter().map(|e| e.level).collect()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.message.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Failover target that copies into a local directory standing in for the
/// remote filesystem and records every command
#[derive(Default)]
pub struct ScriptedHost {
    pub calls: Mutex<Vec<String>>,
    /// Commands containing this text fail
    pub fail_on: Mutex<Option<String>>,
}

impl ScriptedHost {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteHost for ScriptedHost {
    async fn exec(&self, target: &str, command: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("exec {} {}", target, command));
        if let Some(needle) = self.fail_on.lock().unwrap().as_deref() {
            if command.contains(needle) {
                return Err(DrError::Process(format!("remote `{}` exited with 1", command)));
            }
        }
        Ok(String::new())
    }

    async fn sync_dir(&self, target: &str, local: &Path, remote: &Path) -> Result<u64> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("sync {} {}", target, remote.display()));
        let files = snapshot(local);
        Ok(files.values().map(|v| v.len() as u64).sum())
    }
}

#[derive(Default)]
pub struct RecordingRouter {
    pub redirects: Mutex<Vec<String>>,
}

#[async_trait]
impl TrafficRouter for RecordingRouter {
    async fn redirect(&self, target: &str) -> Result<()> {
        self.redirects.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

pub struct Fixture {
    pub root: TempDir,
    pub config: Config,
    pub node: Arc<MockNode>,
    pub notifier: Arc<RecordingNotifier>,
    pub host: Arc<ScriptedHost>,
    pub router: Arc<RecordingRouter>,
}

impl Fixture {
    /// Running node at height 1000 that is healthy immediately after a start
    pub fn new() -> Self {
        Self::with_node(MockNode::new(1000, Duration::ZERO))
    }

    pub fn with_node(node: Arc<MockNode>) -> Self {
        let root = TempDir::new().unwrap();
        let mut config = Config::default();
        config.node.data_dir = root.path().join("node/data");
        config.node.stop_timeout_secs = 5;
        config.storage.backup_dir = root.path().join("backups");
        config.storage.restore_dir = root.path().join("restore");
        config.storage.min_free_bytes = 0;
        config.health.max_attempts = 30;
        config.health.interval_secs = 10;

        populate(&config.node.data_dir);

        Self {
            root,
            config,
            node,
            notifier: Arc::new(RecordingNotifier::default()),
            host: Arc::new(ScriptedHost::default()),
            router: Arc::new(RecordingRouter::default()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.node.data_dir
    }

    pub fn bucket(&self) -> PathBuf {
        self.root.path().join("bucket")
    }

    pub fn enable_remote(&mut self) {
        self.config.remote.backend = Some("fs".into());
        self.config.remote.bucket = Some(self.bucket().to_string_lossy().to_string());
    }

    pub fn remote_store(&self) -> Option<Arc<dyn ObjectStore>> {
        self.config.remote.bucket.as_ref().map(|b| {
            Arc::new(FsObjectStore::new(PathBuf::from(b), &self.config.remote.prefix))
                as Arc<dyn ObjectStore>
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        let collaborators = Collaborators {
            process: self.node.clone(),
            rpc: self.node.clone(),
            object_store: self.remote_store(),
            remote_host: self.host.clone(),
            router: self.router.clone(),
            notifier: self.notifier.clone(),
        };
        Dispatcher::new(&self.config, collaborators).unwrap()
    }
}

/// Ten files across a geth-like layout plus transient noise
pub fn populate(data_dir: &Path) {
    let files: &[(&str, &[u8])] = &[
        ("nodekey", b"0123456789abcdef"),
        ("chaindata/CURRENT", b"MANIFEST-000004\n"),
        ("chaindata/MANIFEST-000004", b"manifest bytes"),
        ("chaindata/000001.ldb", &[7u8; 4096]),
        ("chaindata/000002.ldb", b"second table"),
        ("chaindata/ancient/headers.cdat", b"ancient headers"),
        ("chaindata/ancient/bodies.cdat", b"ancient bodies"),
        ("keystore/UTC--2026-01-01--abc", b"{\"address\":\"abc\"}"),
        ("nodes/000003.log.ldb", b"peer table"),
        ("jwtsecret", b"secret"),
    ];
    for (rel, body) in files {
        let path = data_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }
    std::fs::write(data_dir.join("geth.log"), b"transient log line\n").unwrap();
    std::fs::create_dir_all(data_dir.join("tmp")).unwrap();
    std::fs::write(data_dir.join("tmp/scratch"), b"scratch").unwrap();
}

/// Relative path -> contents for every regular file under `dir`
pub fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(dir).unwrap();
            files.insert(
                rel.to_string_lossy().to_string(),
                std::fs::read(entry.path()).unwrap(),
            );
        }
    }
    files
}

/// `snapshot` without the transient entries backups never carry
pub fn durable_snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    snapshot(dir)
        .into_iter()
        .filter(|(k, _)| k != "geth.log" && !k.starts_with("tmp/"))
        .collect()
}
