//! The harvester worker: a priority queue of keywords drained by one
//! background task. Each keyword flows search → rank → fetch → aggregate →
//! store; any step failure abandons that task and the worker moves on.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use loreweave_llm::RoleClient;
use loreweave_vector::VectorCollection;

use crate::aggregate::aggregate;
use crate::crawler::Crawler;

const DEFAULT_PRIORITY: u8 = 10;
const MAX_RESULTS: usize = 6;

fn default_whitelist() -> Vec<String> {
    ["wikipedia.org", "baike.baidu.com", "zhihu.com", "gamersky.com", "ali213.net"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_blacklist() -> Vec<String> {
    ["csdn.net", "baidu.com/link", "weibo.com", "bilibili.com"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Queue entry: smaller priority pops first; the sequence number keeps
/// equal-priority tasks FIFO.
type QueuedTask = Reverse<(u8, u64, String)>;

struct Queue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
    notify: Notify,
}

/// Cheap handle for enqueueing keywords from anywhere in the pipeline.
#[derive(Clone)]
pub struct HarvesterHandle {
    queue: Arc<Queue>,
}

impl HarvesterHandle {
    pub fn add_task(&self, keyword: &str, priority: u8) {
        if keyword.trim().is_empty() {
            return;
        }
        info!(keyword, priority, "harvest task queued");
        let seq = self.queue.seq.fetch_add(1, Ordering::Relaxed);
        self.queue
            .heap
            .lock()
            .unwrap()
            .push(Reverse((priority, seq, keyword.trim().to_string())));
        self.queue.notify.notify_one();
    }

    pub fn add_task_default(&self, keyword: &str) {
        self.add_task(keyword, DEFAULT_PRIORITY);
    }

    pub fn pending(&self) -> usize {
        self.queue.heap.lock().unwrap().len()
    }

    fn pop(&self) -> Option<(u8, String)> {
        self.queue
            .heap
            .lock()
            .unwrap()
            .pop()
            .map(|Reverse((priority, _, keyword))| (priority, keyword))
    }
}

pub struct Harvester {
    handle: HarvesterHandle,
    crawler: Crawler,
    seeker: RoleClient,
    lore: VectorCollection,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl Harvester {
    /// Build the worker and its enqueue handle. Spawn `run` once.
    pub fn new(seeker: RoleClient, lore: VectorCollection) -> (Self, HarvesterHandle) {
        let handle = HarvesterHandle {
            queue: Arc::new(Queue {
                heap: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        };
        (
            Self {
                handle: handle.clone(),
                crawler: Crawler::new(),
                seeker,
                lore,
                whitelist: default_whitelist(),
                blacklist: default_blacklist(),
            },
            handle,
        )
    }

    /// Worker loop. Runs until `shutdown` flips true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("harvester started (batch aggregation mode)");
        loop {
            let task = self.handle.pop();
            match task {
                Some((priority, keyword)) => {
                    info!(keyword, priority, "harvest task started");
                    self.process_task(&keyword).await;
                }
                None => {
                    tokio::select! {
                        _ = self.handle.queue.notify.notified() => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("harvester shutting down");
                                return;
                            }
                        }
                    }
                }
            }
            if *shutdown.borrow() {
                info!("harvester shutting down");
                return;
            }
        }
    }

    async fn process_task(&self, keyword: &str) {
        let pages = self
            .crawler
            .search_and_fetch(keyword, &self.whitelist, &self.blacklist, MAX_RESULTS)
            .await;
        if pages.is_empty() {
            warn!(keyword, "nothing fetched, task abandoned");
            return;
        }

        let Some(summary) = aggregate(&self.seeker, keyword, &pages).await else {
            warn!(keyword, "aggregation failed, task abandoned");
            return;
        };

        let sources: Vec<String> = pages.iter().map(|p| p.domain.clone()).collect();
        let now = chrono::Utc::now().timestamp();
        let memory_id = format!("lore_{now}_{:04x}", simple_hash(keyword) % 0x10000);

        let metadata = serde_json::json!({
            "type": "INTERNET_LORE",
            "keyword": keyword,
            "sources": sources.join(", "),
            "timestamp": now.to_string(),
            "quality": "high_batch",
        });

        match self.lore.add(&summary, metadata, &memory_id).await {
            Ok(()) => info!(
                keyword,
                chars = summary.chars().count(),
                "deep lore entry saved"
            ),
            Err(e) => error!(keyword, err = %e, "lore store failed, task abandoned"),
        }
    }
}

fn simple_hash(s: &str) -> u64 {
    // FNV-1a, enough to decorate ids
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
