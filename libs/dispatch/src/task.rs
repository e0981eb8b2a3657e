//! Units of dispatch work
//!
//! A [`Task`] pairs one decoded [`Message`] with where it came from and, once
//! routed, the [`Router`] that will handle it. Tasks are recycled through an
//! [`ObjectPool`]; ownership moves back into the pool on release.

use crate::error::{DispatchError, DispatchResult};
use crate::pool::{ObjectPool, Poolable};
use crate::router::{MsgId, Router};
use async_trait::async_trait;
use codec::Message;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// The socket-side peer a task can reply to
#[async_trait]
pub trait Session: Send + Sync {
    fn conn_id(&self) -> u64;

    fn is_alive(&self) -> bool;

    /// Encode and write `msg` to the peer
    async fn send_msg(&self, msg: &Message) -> anyhow::Result<()>;
}

/// Resets the broker's in-flight timer for one delivery
#[async_trait]
pub trait Touch: Send + Sync {
    async fn touch(&self) -> anyhow::Result<()>;
}

/// Broker-native delivery details of an inbound message
#[derive(Clone, Default)]
pub struct DeliveryHandle {
    /// Broker message id, hex encoded
    pub id: String,
    /// Delivery attempt, starting at 1
    pub attempts: u16,
    /// Broker timestamp in nanoseconds
    pub timestamp: i64,
    pub topic: String,
    /// Set by brokers that time out in-flight deliveries
    pub toucher: Option<Arc<dyn Touch>>,
}

impl DeliveryHandle {
    /// Ask the broker for more time before it redelivers this message.
    /// A no-op on brokers without an in-flight timeout.
    pub async fn touch(&self) -> anyhow::Result<()> {
        match &self.toucher {
            Some(toucher) => toucher.touch().await,
            None => Ok(()),
        }
    }

    pub fn can_touch(&self) -> bool {
        self.toucher.is_some()
    }
}

impl PartialEq for DeliveryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.attempts == other.attempts
            && self.timestamp == other.timestamp
            && self.topic == other.topic
    }
}

impl Eq for DeliveryHandle {}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("timestamp", &self.timestamp)
            .field("topic", &self.topic)
            .field("touchable", &self.can_touch())
            .finish()
    }
}

/// Where a task's message came from
#[derive(Clone, Default)]
pub enum TaskOrigin {
    /// Built in-process, nothing to reply to
    #[default]
    Detached,
    /// Read from a live connection
    Session(Arc<dyn Session>),
    /// Delivered by the message broker
    Broker(DeliveryHandle),
}

impl fmt::Debug for TaskOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => f.write_str("Detached"),
            Self::Session(s) => f.debug_tuple("Session").field(&s.conn_id()).finish(),
            Self::Broker(h) => f.debug_tuple("Broker").field(h).finish(),
        }
    }
}

#[derive(Default)]
pub struct Task {
    origin: TaskOrigin,
    message: Message,
    router: Option<Arc<dyn Router>>,
}

impl Task {
    pub fn new(origin: TaskOrigin, message: Message) -> Self {
        Self {
            origin,
            message,
            router: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn msg_id(&self) -> MsgId {
        self.message.msg_id()
    }

    pub fn origin(&self) -> &TaskOrigin {
        &self.origin
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        match &self.origin {
            TaskOrigin::Session(s) => Some(s),
            _ => None,
        }
    }

    pub fn delivery(&self) -> Option<&DeliveryHandle> {
        match &self.origin {
            TaskOrigin::Broker(h) => Some(h),
            _ => None,
        }
    }

    pub fn router(&self) -> Option<&Arc<dyn Router>> {
        self.router.as_ref()
    }

    pub fn bind_router(&mut self, router: Arc<dyn Router>) {
        self.router = Some(router);
    }

    /// Send `msg` back on the originating connection
    pub async fn reply(&self, msg: &Message) -> DispatchResult<()> {
        let session = self.session().ok_or(DispatchError::NoSession {
            msg_id: self.msg_id(),
        })?;
        session
            .send_msg(msg)
            .await
            .map_err(|e| DispatchError::Reply {
                conn_id: session.conn_id(),
                message: format!("{:#}", e),
            })
    }

    /// Run the bound router's pre, handle and post stages in order
    pub async fn call(&self) -> DispatchResult<()> {
        let msg_id = self.msg_id();
        let router = self
            .router
            .as_ref()
            .ok_or(DispatchError::RouteNotFound { msg_id })?;

        router
            .pre_handle(self)
            .await
            .map_err(|e| DispatchError::handler(msg_id, "pre_handle", e))?;
        router
            .handle(self)
            .await
            .map_err(|e| DispatchError::handler(msg_id, "handle", e))?;
        router
            .post_handle(self)
            .await
            .map_err(|e| DispatchError::handler(msg_id, "post_handle", e))
    }

    /// [`Task::call`] with panics contained and logged
    pub async fn call_guarded(&self) -> DispatchResult<()> {
        match AssertUnwindSafe(self.call()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let err = DispatchError::panicked(Some(self.msg_id()), payload.as_ref());
                error!(
                    msg_id = self.msg_id(),
                    origin = ?self.origin,
                    backtrace = %Backtrace::force_capture(),
                    "recovered from router panic: {}",
                    err
                );
                Err(err)
            }
        }
    }
}

impl Poolable for Task {
    fn reset(&mut self) {
        self.origin = TaskOrigin::Detached;
        self.message.reset();
        self.router = None;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("origin", &self.origin)
            .field("msg_id", &self.msg_id())
            .field("seq", &self.message.seq)
            .field("routed", &self.router.is_some())
            .finish()
    }
}

pub type TaskPool = ObjectPool<Task>;

impl ObjectPool<Task> {
    /// Pooled task for `message`
    pub fn task(&self, origin: TaskOrigin, message: Message) -> Task {
        let mut task = self.acquire();
        task.origin = origin;
        task.message = message;
        task
    }
}

/// A function call queued on the worker pool
pub struct FuncTask {
    name: &'static str,
    fut: BoxFuture<'static, anyhow::Result<()>>,
}

impl FuncTask {
    pub fn new<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            fut: fut.boxed(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run to completion with panics contained and logged
    pub async fn run(self) -> DispatchResult<()> {
        let name = self.name;
        match AssertUnwindSafe(self.fut).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Handler {
                msg_id: 0,
                stage: name,
                message: format!("{:#}", e),
            }),
            Err(payload) => {
                let err = DispatchError::panicked(None, payload.as_ref());
                error!(
                    func = name,
                    backtrace = %Backtrace::force_capture(),
                    "recovered from function task panic: {}",
                    err
                );
                Err(err)
            }
        }
    }
}

impl fmt::Debug for FuncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncTask").field("name", &self.name).finish()
    }
}

/// One entry of the worker queue
#[derive(Debug)]
pub enum Job {
    Message(Task),
    Func(FuncTask),
}
