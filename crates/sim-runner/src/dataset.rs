use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::warn;

use sim_core::{DatasetDescriptor, DatasetFormat};

/// Fetches raw dataset text by URL. Swappable so tests never touch the
/// network.
pub trait FetchBytes: Send + Sync {
    fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building dataset http client")?;
        Ok(Self { client })
    }
}

impl FetchBytes for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("fetching dataset from {}", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("dataset fetch from {} returned {}", url, status));
        }
        Ok(response.text()?)
    }
}

enum SlotState {
    Fetching,
    Ready(Arc<Value>),
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

/// Process-wide dataset cache, keyed by storage key. Payloads are parsed
/// once and shared by reference across every run. Concurrent misses for the
/// same key are de-duplicated: the first caller fetches, later callers block
/// on the in-flight slot until it resolves. Failed fetches are not cached,
/// so a later run retries.
pub struct DatasetCache {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    fetcher: Box<dyn FetchBytes>,
}

impl DatasetCache {
    pub fn new() -> Result<Self> {
        Ok(Self::with_fetcher(Box::new(HttpFetcher::new()?)))
    }

    pub fn with_fetcher(fetcher: Box<dyn FetchBytes>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            fetcher,
        }
    }

    pub fn get_or_fetch(&self, descriptor: &DatasetDescriptor) -> Result<Arc<Value>> {
        let key = descriptor.effective_storage_key();
        let (slot, owner) = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| anyhow!("dataset cache lock poisoned"))?;
            match slots.get(&key) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(Slot {
                        state: Mutex::new(SlotState::Fetching),
                        ready: Condvar::new(),
                    });
                    slots.insert(key.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if !owner {
            return self.wait_for(&slot, &key);
        }

        match self.fetch_and_parse(descriptor) {
            Ok(payload) => {
                let payload = Arc::new(payload);
                let mut state = slot
                    .state
                    .lock()
                    .map_err(|_| anyhow!("dataset slot lock poisoned"))?;
                *state = SlotState::Ready(payload.clone());
                slot.ready.notify_all();
                Ok(payload)
            }
            Err(err) => {
                {
                    let mut state = slot
                        .state
                        .lock()
                        .map_err(|_| anyhow!("dataset slot lock poisoned"))?;
                    *state = SlotState::Failed(err.to_string());
                    slot.ready.notify_all();
                }
                let mut slots = self
                    .slots
                    .lock()
                    .map_err(|_| anyhow!("dataset cache lock poisoned"))?;
                slots.remove(&key);
                Err(err)
            }
        }
    }

    fn wait_for(&self, slot: &Arc<Slot>, key: &str) -> Result<Arc<Value>> {
        let mut state = slot
            .state
            .lock()
            .map_err(|_| anyhow!("dataset slot lock poisoned"))?;
        loop {
            match &*state {
                SlotState::Ready(payload) => return Ok(payload.clone()),
                SlotState::Failed(message) => {
                    return Err(anyhow!("dataset fetch for {} failed: {}", key, message))
                }
                SlotState::Fetching => {
                    state = slot
                        .ready
                        .wait(state)
                        .map_err(|_| anyhow!("dataset slot lock poisoned"))?;
                }
            }
        }
    }

    fn fetch_and_parse(&self, descriptor: &DatasetDescriptor) -> Result<Value> {
        let raw = match (&descriptor.in_place_data, &descriptor.source_url) {
            (Some(data), _) => data.clone(),
            (None, Some(url)) => self.fetcher.fetch(url)?,
            (None, None) => {
                return Err(anyhow!(
                    "dataset '{}' has neither in-place data nor a source url",
                    descriptor.shortname
                ))
            }
        };
        parse_dataset(&raw, descriptor.format)
            .with_context(|| format!("parsing dataset '{}'", descriptor.shortname))
    }
}

fn parse_dataset(raw: &str, format: DatasetFormat) -> Result<Value> {
    match format {
        DatasetFormat::Json => Ok(serde_json::from_str(raw)?),
        DatasetFormat::Csv => Ok(parse_csv(raw)),
    }
}

/// Rows of string cells; quoted fields may contain commas and doubled quotes.
fn parse_csv(raw: &str) -> Value {
    let mut rows = Vec::new();
    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        let mut cells = Vec::new();
        let mut cell = String::new();
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '"' if in_quotes && chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => {
                    cells.push(Value::String(std::mem::take(&mut cell)));
                }
                _ => cell.push(ch),
            }
        }
        cells.push(Value::String(cell));
        rows.push(Value::Array(cells));
    }
    Value::Array(rows)
}

/// A dataset resolved for one run.
#[derive(Clone)]
pub struct LoadedDataset {
    pub storage_key: String,
    pub shortname: String,
    pub payload: Arc<Value>,
}

/// Resolve every descriptor through the cache. A failed dataset is logged
/// and omitted rather than aborting the run.
pub fn load_manifest_datasets(
    cache: &DatasetCache,
    descriptors: &[DatasetDescriptor],
) -> Vec<LoadedDataset> {
    let mut loaded = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        match cache.get_or_fetch(descriptor) {
            Ok(payload) => loaded.push(LoadedDataset {
                storage_key: descriptor.effective_storage_key(),
                shortname: descriptor.shortname.clone(),
                payload,
            }),
            Err(err) => {
                warn!(
                    dataset = %descriptor.shortname,
                    error = %err,
                    "unable to load dataset, omitting it from this run"
                );
            }
        }
    }
    loaded
}
