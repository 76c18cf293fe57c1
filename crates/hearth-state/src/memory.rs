// Single-process store used when no external store is configured, and by the
// test suites. Atomicity is a process-wide mutex; pub/sub is a broadcast
// channel per topic.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::{Result, StateStore, StoreError, WriteOp};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
    // member -> score
    Sorted(BTreeMap<String, f64>),
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a `StoreError`. Lets callers
    /// exercise their degraded paths without a real outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected store failure".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_to(values: &mut HashMap<String, Value>, key: &str, delta: i64) -> Result<i64> {
        let current = match values.get(key) {
            None => 0,
            Some(Value::Str(raw)) => raw.parse::<i64>().map_err(|_| {
                StoreError::Command(format!("value at {key} is not an integer"))
            })?,
            Some(_) => {
                return Err(StoreError::Command(format!(
                    "wrong value kind at {key} for integer op"
                )))
            }
        };
        let next = current + delta;
        values.insert(key.to_string(), Value::Str(next.to_string()));
        Ok(next)
    }

    fn sorted_entry<'a>(
        values: &'a mut HashMap<String, Value>,
        key: &str,
    ) -> Result<&'a mut BTreeMap<String, f64>> {
        match values
            .entry(key.to_string())
            .or_insert_with(|| Value::Sorted(BTreeMap::new()))
        {
            Value::Sorted(members) => Ok(members),
            _ => Err(StoreError::Command(format!(
                "wrong value kind at {key} for sorted-set op"
            ))),
        }
    }

    fn apply(values: &mut HashMap<String, Value>, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Set { key, value } => {
                values.insert(key.clone(), Value::Str(value.clone()));
            }
            WriteOp::IncrBy { key, delta } => {
                Self::add_to(values, key, *delta)?;
            }
            WriteOp::SortedAdd { key, score, member } => {
                Self::sorted_entry(values, key)?.insert(member.clone(), *score);
            }
            WriteOp::SortedRemoveByScore { key, min, max } => {
                if let Some(Value::Sorted(members)) = values.get_mut(key) {
                    members.retain(|_, score| *score < *min || *score > *max);
                }
            }
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, -1).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.check_available()?;
        Self::add_to(&mut self.lock(), key, delta)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        self.check_available()?;
        let values = self.lock();
        match values.get(key) {
            None => Ok(None),
            Some(Value::Str(raw)) => match raw.parse::<i64>() {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    tracing::warn!(key, raw, "non-numeric value where integer expected");
                    Ok(None)
                }
            },
            Some(_) => {
                tracing::warn!(key, "non-string value where integer expected");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.lock()
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut values = self.lock();
        match values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()))
        {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(StoreError::Command(format!(
                "wrong value kind at {key} for set op"
            ))),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let values = self.lock();
        match values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::Command(format!(
                "wrong value kind at {key} for set op"
            ))),
        }
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.check_available()?;
        Self::sorted_entry(&mut self.lock(), key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.check_available()?;
        let values = self.lock();
        let Some(Value::Sorted(members)) = values.get(key) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<(f64, String)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        matching.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(matching.into_iter().map(|(_, member)| member).collect())
    }

    async fn sorted_remove_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.check_available()?;
        let mut values = self.lock();
        let Some(Value::Sorted(members)) = values.get_mut(key) else {
            return Ok(0);
        };
        let before = members.len();
        members.retain(|_, score| *score < min || *score > max);
        Ok((before - members.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn atomic(&self, ops: &[WriteOp]) -> Result<()> {
        self.check_available()?;
        let mut values = self.lock();
        for op in ops {
            Self::apply(&mut values, op)?;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.check_available()?;
        // No subscribers is not an error.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>> {
        self.check_available()?;
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }
}
