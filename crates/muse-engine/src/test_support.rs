use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use muse_contracts::candidates::CandidateImage;
use muse_contracts::events::EventWriter;
use muse_contracts::store::{MemoryStore, RegistrySnapshot, RegistryStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::config::SelectorConfig;
use crate::error::JudgeError;
use crate::grid::GridCompositor;
use crate::oracle::{JudgeRequest, SelectionOracle, VisionJudge};
use crate::registry::ImageRegistry;
use crate::select::Selector;

pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> anyhow::Result<Vec<u8>> {
    let image = RgbImage::from_pixel(width, height, Rgb(rgb));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

pub fn write_png(path: &Path, width: u32, height: u32, rgb: [u8; 3]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, png_bytes(width, height, rgb)?)?;
    Ok(())
}

pub struct FailingStore;

impl RegistryStore for FailingStore {
    fn describe(&self) -> String {
        "failing".to_string()
    }

    fn load(&self) -> anyhow::Result<Option<RegistrySnapshot>> {
        anyhow::bail!("store offline")
    }

    fn save(&self, _snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
        anyhow::bail!("store offline")
    }
}

/// Minimal HTTP/1.1 server answering GETs from a fixed route table.
pub struct StaticServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl StaticServer {
    pub async fn start(routes: Vec<(&str, Vec<u8>)>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let routes: Arc<HashMap<String, Vec<u8>>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, body)| (path.to_string(), body))
                .collect(),
        );
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buffer = vec![0u8; 4096];
                    let mut read = 0;
                    loop {
                        let Ok(count) = socket.read(&mut buffer[read..]).await else {
                            return;
                        };
                        if count == 0 {
                            break;
                        }
                        read += count;
                        if buffer[..read].windows(4).any(|window| window == b"\r\n\r\n")
                            || read == buffer.len()
                        {
                            break;
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let request = String::from_utf8_lossy(&buffer[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = match routes.get(&path) {
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", Vec::new()),
                    };
                    let head = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n\
                         Content-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Ok(Self { addr, hits })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Judge that replays canned replies and records every prompt it saw.
#[derive(Default)]
pub struct ScriptedJudge {
    replies: Mutex<Vec<Result<String, String>>>,
    fallback: Option<String>,
    seen: Mutex<Vec<JudgeRequest>>,
}

impl ScriptedJudge {
    pub fn always(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn sequence(replies: Vec<Result<String, String>>) -> Self {
        let mut replies = replies;
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<JudgeRequest> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VisionJudge for ScriptedJudge {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        let next = self.replies.lock().ok().and_then(|mut replies| replies.pop());
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(_)) => Err(JudgeError::EmptyResponse),
            None => self.fallback.clone().ok_or(JudgeError::EmptyResponse),
        }
    }
}

/// Writes `count` distinctly colored PNGs under `root/dir` and returns one
/// candidate per file. Indices in `missing` get a candidate but no file.
pub fn candidate_pool(
    root: &Path,
    dir: &str,
    count: usize,
    missing: &[usize],
) -> anyhow::Result<Vec<CandidateImage>> {
    let mut pool = Vec::with_capacity(count);
    for index in 0..count {
        let path = root.join(dir).join(format!("design{index}.png"));
        if !missing.contains(&index) {
            let shade = (index * 13 % 256) as u8;
            write_png(&path, 12, 8, [shade, 255 - shade, 128])?;
        }
        pool.push(
            CandidateImage::new(format!("https://gallery.test/shot/{index}"))
                .with_title(format!("Design {index}"))
                .with_thumbnail(path.to_string_lossy().to_string()),
        );
    }
    Ok(pool)
}

pub struct SelectorFixture {
    temp: tempfile::TempDir,
    pub registry: Arc<ImageRegistry>,
    pub events: EventWriter,
    pub selector: Selector,
}

impl SelectorFixture {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }
}

/// Selector over an in-memory registry with grids and events in a temp dir.
pub fn selector_fixture(
    judge: Arc<dyn VisionJudge>,
    config: SelectorConfig,
) -> anyhow::Result<SelectorFixture> {
    let temp = tempfile::tempdir()?;
    let registry = Arc::new(ImageRegistry::new(
        Box::new(MemoryStore::new()),
        temp.path().join("reference"),
        reqwest::Client::new(),
    ));
    let events = EventWriter::new(temp.path().join("metadata/events.jsonl"), "test-session");
    let compositor = Arc::new(
        GridCompositor::new(registry.clone(), temp.path().join("grids"))
            .with_events(events.clone()),
    );
    let oracle = SelectionOracle::new(judge).with_events(events.clone());
    let selector = Selector::new(compositor, oracle, config).with_events(events.clone());
    Ok(SelectorFixture {
        temp,
        registry,
        events,
        selector,
    })
}
