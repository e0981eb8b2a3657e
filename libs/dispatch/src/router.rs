//! Router capability and the message-id routing table

use crate::error::{DispatchError, DispatchResult};
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Routing key: the message `cmd`
pub type MsgId = u16;

/// Handler bound to exactly one message id
///
/// `pre_handle` and `post_handle` default to no-ops. A failing stage stops the
/// remaining stages for that task.
#[async_trait]
pub trait Router: Send + Sync {
    async fn pre_handle(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, task: &Task) -> anyhow::Result<()>;

    async fn post_handle(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Message id to router mapping, filled before traffic starts
///
/// Owners freeze the table into an `Arc` when they start; from then on it is
/// read-only.
#[derive(Default, Clone)]
pub struct RouterTable {
    routes: HashMap<MsgId, Arc<dyn Router>>,
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `router` for `msg_id`; a second registration is a setup error
    pub fn add(&mut self, msg_id: MsgId, router: Arc<dyn Router>) -> DispatchResult<()> {
        if self.routes.contains_key(&msg_id) {
            return Err(DispatchError::DuplicateRouter { msg_id });
        }
        self.routes.insert(msg_id, router);
        Ok(())
    }

    pub fn get(&self, msg_id: MsgId) -> Option<&Arc<dyn Router>> {
        self.routes.get(&msg_id)
    }

    pub fn contains(&self, msg_id: MsgId) -> bool {
        self.routes.contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered ids in ascending order
    pub fn msg_ids(&self) -> Vec<MsgId> {
        let mut ids: Vec<_> = self.routes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Look up the task's router and bind it to the task
    pub fn bind(&self, task: &mut Task) -> DispatchResult<()> {
        let msg_id = task.msg_id();
        let router = self
            .routes
            .get(&msg_id)
            .ok_or(DispatchError::RouteNotFound { msg_id })?;
        task.bind_router(router.clone());
        Ok(())
    }
}

impl std::fmt::Debug for RouterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterTable")
            .field("msg_ids", &self.msg_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOrigin;
    use codec::{Message, Metadata, SerializeType};

    struct Noop;

    #[async_trait]
    impl Router for Noop {
        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = RouterTable::new();
        table.add(1, Arc::new(Noop)).unwrap();
        table.add(2, Arc::new(Noop)).unwrap();

        let err = table.add(1, Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateRouter { msg_id: 1 }));
        assert!(err.is_setup_error());
        assert_eq!(table.msg_ids(), vec![1, 2]);
    }

    #[test]
    fn test_bind_missing_route() {
        let table = RouterTable::new();
        let msg = Message::new(44, 0, SerializeType::None, Metadata::new(), "x");
        let mut task = Task::new(TaskOrigin::Detached, msg);

        let err = table.bind(&mut task).unwrap_err();
        assert!(matches!(err, DispatchError::RouteNotFound { msg_id: 44 }));
        assert!(task.router().is_none());
    }

    #[test]
    fn test_bind_sets_router() {
        let mut table = RouterTable::new();
        table.add(3, Arc::new(Noop)).unwrap();
        let msg = Message::new(3, 0, SerializeType::None, Metadata::new(), "x");
        let mut task = Task::new(TaskOrigin::Detached, msg);

        table.bind(&mut task).unwrap();
        assert!(task.router().is_some());
    }
}
