//! Shared fixtures: an in-memory upstream, a deterministic embedder, and a
//! generator for tactic source files.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use defense_kb::config::Config;
use defense_kb::error::FetchError;
use defense_kb::fetch::Transport;
use defense_kb::service::Service;
use defense_kb::slots::{open_slots, GenerationSlots};
use defense_kb_core::embedding::Embedder;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use url::Url;

pub const SHA_A: &str = "abc1230000000000000000000000000000000000";
pub const SHA_B: &str = "def4560000000000000000000000000000000000";

/// `(file, export name, tactic name, id letter)` for every tactic file.
pub const TACTICS: [(&str, &str, &str, char); 7] = [
    ("model.js", "model", "Model", 'M'),
    ("harden.js", "harden", "Harden", 'H'),
    ("detect.js", "detect", "Detect", 'D'),
    ("isolate.js", "isolate", "Isolate", 'I'),
    ("deceive.js", "deceive", "Deceive", 'C'),
    ("evict.js", "evict", "Evict", 'E'),
    ("restore.js", "restore", "Restore", 'R'),
];

// ============ Upstream ============

struct Release {
    version: String,
    files: HashMap<String, String>,
}

/// Serves a commit endpoint and raw files from memory.
pub struct FakeUpstream {
    release: Mutex<Release>,
    failing: Mutex<HashSet<String>>,
    commit_requests: AtomicUsize,
    file_requests: AtomicUsize,
}

impl FakeUpstream {
    pub fn new(version: &str, files: HashMap<String, String>) -> Self {
        Self {
            release: Mutex::new(Release {
                version: version.to_string(),
                files,
            }),
            failing: Mutex::new(HashSet::new()),
            commit_requests: AtomicUsize::new(0),
            file_requests: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, version: &str, files: HashMap<String, String>) {
        *self.release.lock().unwrap() = Release {
            version: version.to_string(),
            files,
        };
    }

    /// Replace one file of the current release.
    pub fn set_file(&self, file: &str, body: &str) {
        self.release
            .lock()
            .unwrap()
            .files
            .insert(file.to_string(), body.to_string());
    }

    /// Make every download of `file` fail with a 500.
    pub fn fail_file(&self, file: &str) {
        self.failing.lock().unwrap().insert(file.to_string());
    }

    pub fn commit_requests(&self) -> usize {
        self.commit_requests.load(Ordering::SeqCst)
    }

    pub fn file_requests(&self) -> usize {
        self.file_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeUpstream {
    async fn get(&self, url: &Url, _max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        if url.path().starts_with("/repos/") {
            self.commit_requests.fetch_add(1, Ordering::SeqCst);
            let version = self.release.lock().unwrap().version.clone();
            return Ok(serde_json::json!({ "sha": version }).to_string().into_bytes());
        }

        self.file_requests.fetch_add(1, Ordering::SeqCst);
        let file = url.path().rsplit('/').next().unwrap_or_default().to_string();
        if self.failing.lock().unwrap().contains(&file) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 500,
            });
        }
        self.release
            .lock()
            .unwrap()
            .files
            .get(&file)
            .map(|body| body.clone().into_bytes())
            .ok_or(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

// ============ Embedder ============

/// Pauses the first document batch until released.
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a build is parked in the gate.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.entered.notified())
            .await
            .expect("build never reached the gate");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Deterministic embeddings derived from a hash of the text.
pub struct HashEmbedder {
    pub gate: Gate,
    model: String,
    dims: usize,
    panic_armed: AtomicBool,
    calls: AtomicUsize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::with_dims(8)
    }
}

impl HashEmbedder {
    /// `dims` is at most 32, the length of the hash.
    pub fn with_dims(dims: usize) -> Self {
        Self {
            gate: Gate::default(),
            model: format!("hash-{dims}"),
            dims,
            panic_armed: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Panic in the next document batch.
    pub fn panic_next_build(&self) {
        self.panic_armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Document texts carry an "ID:" line; queries do not.
        let is_build = texts.iter().any(|t| t.contains("\nID: "));
        if is_build && self.panic_armed.swap(false, Ordering::SeqCst) {
            panic!("embedding backend crashed");
        }
        if is_build && self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }

        Ok(texts.iter().map(|t| hash_vector(t, self.dims)).collect())
    }
}

fn hash_vector(text: &str, dims: usize) -> Vec<f32> {
    Sha256::digest(text.as_bytes())
        .iter()
        .take(dims)
        .map(|b| *b as f32 / 255.0 + 0.1)
        .collect()
}

// ============ Sources ============

/// A tactic module with `count` techniques. The first technique defends
/// against OWASP LLM01.
pub fn tactic_js(export: &str, name: &str, letter: char, count: usize) -> String {
    let techniques: Vec<String> = (1..=count)
        .map(|i| {
            let defends = if i == 1 {
                r#""defendsAgainst": [{ "framework": "OWASP LLM Top 10 2025", "items": ["LLM01:2025 Prompt Injection"] }],"#
            } else {
                ""
            };
            format!(
                r#"    {{
        "id": "AID-{letter}-{i:03}",
        "name": "{name} Technique {i}",
        "description": "Defends the {name} surface against prompt injection variant {i}.",
        "pillar": "app",
        "phase": "operation",
        {defends}
        "toolsOpenSource": ["garak"],
    }},"#
            )
        })
        .collect();

    format!(
        "// generated\nexport const {export} = {{\n  \"name\": \"{name}\",\n  \"techniques\": [\n{}\n  ],\n}};\n",
        techniques.join("\n")
    )
}

/// One release with `counts[i]` techniques in the i-th tactic file.
pub fn release(counts: [usize; 7]) -> HashMap<String, String> {
    TACTICS
        .iter()
        .zip(counts)
        .map(|((file, export, name, letter), count)| {
            (file.to_string(), tactic_js(export, name, *letter, count))
        })
        .collect()
}

/// 480 documents.
pub fn release_a() -> HashMap<String, String> {
    release([69, 69, 69, 69, 69, 69, 66])
}

/// 500 documents.
pub fn release_b() -> HashMap<String, String> {
    release([72, 72, 72, 72, 72, 72, 68])
}

// ============ Harness ============

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.data.root = root.to_path_buf();
    config.embedding.batch_size = 64;
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub upstream: Arc<FakeUpstream>,
    pub embedder: Arc<HashEmbedder>,
    pub service: Service,
}

impl Harness {
    /// A fresh service over an empty data root, with release A published.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Like [`Harness::new`] with adjusted configuration.
    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);
        let slots = open_slots(config.sync.swap_mode, &config.data.index_dir()).unwrap();
        Self::assemble(dir, config, slots)
    }

    /// Like [`Harness::new`] with a custom slot layout over the index dir.
    pub fn with_slots(make: impl FnOnce(&Path) -> Arc<dyn GenerationSlots>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let slots = make(&config.data.index_dir());
        Self::assemble(dir, config, slots)
    }

    fn assemble(dir: TempDir, config: Config, slots: Arc<dyn GenerationSlots>) -> Self {
        let upstream = Arc::new(FakeUpstream::new(SHA_A, release_a()));
        let embedder = Arc::new(HashEmbedder::default());
        let service = Service::with_slots(config.clone(), upstream.clone(), embedder.clone(), slots);
        Self {
            dir,
            config,
            upstream,
            embedder,
            service,
        }
    }

    /// A second service over the same data root, as after a restart.
    pub fn restart(&self) -> Service {
        self.restart_with(self.embedder.clone())
    }

    /// Restart with a different embedding backend.
    pub fn restart_with(&self, embedder: Arc<HashEmbedder>) -> Service {
        Service::with_parts(self.config.clone(), self.upstream.clone(), embedder).unwrap()
    }

    /// Poll until a version record for `version` has been written.
    pub async fn wait_for_version(&self, version: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let record = self.service.orchestrator.version_record();
            if record.is_some_and(|r| r.content_version == version) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "version {version} was never recorded"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
