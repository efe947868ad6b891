//! Message queues with visibility timeouts
//!
//! Received messages stay in the queue, invisible, until deleted by receipt or until
//! their visibility timeout lapses.

use crate::error::{BossError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    /// Handle for delete/change-visibility, valid for this receive only
    pub receipt: String,
    pub body: String,
    pub receive_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn url(&self) -> &str;

    /// Enqueue a message, returning its id
    async fn send(&self, body: String) -> Result<String>;

    async fn send_batch(&self, bodies: Vec<String>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            ids.push(self.send(body).await?);
        }
        Ok(ids)
    }

    /// Up to `max` visible messages, hidden for `visibility` afterwards
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Message>>;

    /// Remove a received message; false if the receipt is stale
    async fn delete(&self, receipt: &str) -> Result<bool>;

    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> Result<()>;

    /// Visible plus in-flight messages
    async fn approximate_len(&self) -> Result<usize>;

    async fn purge(&self) -> Result<()>;
}

struct Stored {
    message: Message,
    invisible_until: Option<Instant>,
}

pub struct MemoryQueue {
    url: String,
    messages: Mutex<VecDeque<Stored>>,
}

impl MemoryQueue {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Messages currently visible
    pub fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.invisible_until.map_or(true, |t| t <= now))
            .count()
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("url", &self.url)
            .field("len", &self.messages.lock().len())
            .finish()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, body: String) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.messages.lock().push_back(Stored {
            message: Message {
                id: id.clone(),
                receipt: String::new(),
                body,
                receive_count: 0,
            },
            invisible_until: None,
        });
        Ok(id)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Message>> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut out = Vec::new();
        for stored in messages.iter_mut() {
            if out.len() >= max {
                break;
            }
            if stored.invisible_until.is_some_and(|t| t > now) {
                continue;
            }
            stored.invisible_until = Some(now + visibility);
            stored.message.receipt = Uuid::new_v4().to_string();
            stored.message.receive_count += 1;
            out.push(stored.message.clone());
        }
        Ok(out)
    }

    async fn delete(&self, receipt: &str) -> Result<bool> {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| m.message.receipt != receipt || receipt.is_empty());
        Ok(messages.len() != before)
    }

    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> Result<()> {
        let mut messages = self.messages.lock();
        let stored = messages
            .iter_mut()
            .find(|m| !receipt.is_empty() && m.message.receipt == receipt)
            .ok_or_else(|| BossError::not_found(format!("No in-flight message for receipt {}", receipt)))?;
        stored.invisible_until = Some(Instant::now() + visibility);
        Ok(())
    }

    async fn approximate_len(&self) -> Result<usize> {
        Ok(self.messages.lock().len())
    }

    async fn purge(&self) -> Result<()> {
        self.messages.lock().clear();
        Ok(())
    }
}

/// Creates and resolves queues by name or URL
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Create (or return the existing) queue named `name`
    async fn create(&self, name: &str) -> Result<Arc<dyn MessageQueue>>;

    async fn get(&self, url: &str) -> Result<Arc<dyn MessageQueue>>;

    async fn delete(&self, url: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryQueueProvider {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryQueueProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url_for(name: &str) -> String {
        format!("memory://queue/{}", name)
    }

    pub fn exists(&self, url: &str) -> bool {
        self.queues.lock().contains_key(url)
    }
}

#[async_trait]
impl QueueProvider for MemoryQueueProvider {
    async fn create(&self, name: &str) -> Result<Arc<dyn MessageQueue>> {
        let url = Self::url_for(name);
        let queue: Arc<dyn MessageQueue> = self
            .queues
            .lock()
            .entry(url.clone())
            .or_insert_with(|| Arc::new(MemoryQueue::new(url)))
            .clone();
        Ok(queue)
    }

    async fn get(&self, url: &str) -> Result<Arc<dyn MessageQueue>> {
        let queue: Arc<dyn MessageQueue> = self
            .queues
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| BossError::not_found(format!("Queue {} does not exist", url)))?;
        Ok(queue)
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.queues.lock().remove(url);
        Ok(())
    }
}
