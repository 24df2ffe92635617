//! In-memory [`Store`] implementation.

use async_trait::async_trait;
use chrono::Utc;
use musubi_core::{
    merge_ids, ActionId, DetailState, EngineError, Expression, Flow, FlowStateUpdate,
    ManagementState, RecordKind, RelStatus, ResourceFlowLock, ResourceFlowRel, ResourceKey,
    Result, Store, Task, TaskDetail, TaskDetailUpdate, TaskManagement, TaskUpdate,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    flows: HashMap<String, Flow>,
    tasks: HashMap<String, Vec<Task>>,
    share_data: HashMap<String, BTreeMap<String, String>>,
    locks: HashMap<ResourceKey, ResourceFlowLock>,
    rels: Vec<ResourceFlowRel>,
    details: Vec<TaskDetail>,
    managements: HashMap<String, TaskManagement>,
}

/// Process-local store backed by hash maps.
///
/// All tables sit behind one lock, so multi-row writes such as
/// [`Store::lock_resource`] are atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing_writes: AtomicU32,
    failing_reads: AtomicU32,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.read();
        f.debug_struct("MemoryStore")
            .field("flows", &tables.flows.len())
            .field("locks", &tables.locks.len())
            .field("details", &tables.details.len())
            .finish()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with [`EngineError::Storage`].
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` reads fail with [`EngineError::Storage`].
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    fn query(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        if take_one(&self.failing_reads) {
            return Err(EngineError::Storage("injected read failure".to_string()));
        }
        Ok(self.read())
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        if take_one(&self.failing_writes) {
            return Err(EngineError::Storage("injected write failure".to_string()));
        }
        Ok(self.tables.write().unwrap_or_else(PoisonError::into_inner))
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Tables {
    fn flow_mut(&mut self, flow_id: &str) -> Result<&mut Flow> {
        self.flows
            .get_mut(flow_id)
            .ok_or_else(|| EngineError::not_found(RecordKind::Flow, flow_id))
    }

    fn task_mut(&mut self, flow_id: &str, action_id: &ActionId) -> Result<&mut Task> {
        self.tasks
            .get_mut(flow_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| &t.action_id == action_id))
            .ok_or_else(|| EngineError::not_found(RecordKind::Task, format!("{flow_id}/{action_id}")))
    }

    fn rel_mut(&mut self, key: &ResourceKey, flow_id: &str) -> Option<&mut ResourceFlowRel> {
        self.rels
            .iter_mut()
            .find(|r| r.res_id == key.res_id && r.res_type == key.res_type && r.flow_id == flow_id)
    }

    fn upsert_rel(&mut self, rel: ResourceFlowRel) {
        let key = ResourceKey::new(&rel.res_id, &rel.res_type);
        match self.rel_mut(&key, &rel.flow_id) {
            Some(existing) => *existing = rel,
            None => self.rels.push(rel),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_flow(&self, flow: Flow, tasks: Vec<Task>) -> Result<()> {
        let mut tables = self.write()?;
        if tables.flows.contains_key(&flow.id) {
            return Err(EngineError::Conflict(format!("flow {} already exists", flow.id)));
        }
        tables
            .share_data
            .insert(flow.id.clone(), flow.initial_share_data.clone());
        tables.tasks.insert(flow.id.clone(), tasks);
        tables.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Flow> {
        self.query()?
            .flows
            .get(flow_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(RecordKind::Flow, flow_id))
    }

    async fn list_flows(&self, filter: &Expression) -> Result<Vec<Flow>> {
        let mut flows: Vec<Flow> = self
            .query()?
            .flows
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(flows)
    }

    async fn update_flow_state(&self, update: &FlowStateUpdate) -> Result<()> {
        let mut tables = self.write()?;
        let flow = tables.flow_mut(&update.flow_id)?;
        if flow.state != update.source {
            return Err(EngineError::Conflict(format!(
                "flow {} is {}, expected {}",
                flow.id, flow.state, update.source
            )));
        }
        flow.state = update.target;
        if let Some(reason) = &update.reason {
            flow.reason = Some(reason.clone());
        }
        flow.updated_at = Utc::now();
        Ok(())
    }

    async fn list_tasks(&self, flow_id: &str) -> Result<Vec<Task>> {
        self.query()?
            .tasks
            .get(flow_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(RecordKind::Flow, flow_id))
    }

    async fn get_task(&self, flow_id: &str, action_id: &ActionId) -> Result<Task> {
        self.query()?
            .tasks
            .get(flow_id)
            .and_then(|tasks| tasks.iter().find(|t| &t.action_id == action_id))
            .cloned()
            .ok_or_else(|| EngineError::not_found(RecordKind::Task, format!("{flow_id}/{action_id}")))
    }

    async fn update_task(&self, update: &TaskUpdate) -> Result<()> {
        let mut tables = self.write()?;
        let task = tables.task_mut(&update.flow_id, &update.action_id)?;
        if !update.expected.is_empty() && !update.expected.contains(&task.state) {
            return Err(EngineError::Conflict(format!(
                "task {}/{} is {}, expected one of {:?}",
                task.flow_id, task.action_id, task.state, update.expected
            )));
        }
        task.state = update.target;
        if let Some(result) = &update.result {
            task.result = Some(result.clone());
        }
        if let Some(reason) = &update.reason {
            task.reason = Some(reason.clone());
        }
        if let Some(count) = update.rollback_count {
            task.rollback_count = count;
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get_share_data(&self, flow_id: &str) -> Result<BTreeMap<String, String>> {
        self.query()?
            .share_data
            .get(flow_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(RecordKind::Flow, flow_id))
    }

    async fn set_share_data(&self, flow_id: &str, key: &str, value: &str) -> Result<()> {
        let mut tables = self.write()?;
        let data = tables
            .share_data
            .get_mut(flow_id)
            .ok_or_else(|| EngineError::not_found(RecordKind::Flow, flow_id))?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn append_share_ids(&self, flow_id: &str, key: &str, ids: &[String]) -> Result<()> {
        let mut tables = self.write()?;
        let data = tables
            .share_data
            .get_mut(flow_id)
            .ok_or_else(|| EngineError::not_found(RecordKind::Flow, flow_id))?;
        let merged = merge_ids(data.get(key).map(String::as_str), ids);
        data.insert(key.to_string(), merged);
        Ok(())
    }

    async fn lock_resource(&self, lock: ResourceFlowLock, rel: ResourceFlowRel) -> Result<()> {
        let mut tables = self.write()?;
        let key = lock.key();
        if let Some(held) = tables.locks.get(&key) {
            return Err(EngineError::Conflict(format!(
                "resource {} is locked by flow {}",
                key, held.owner
            )));
        }
        tables.locks.insert(key, lock);
        tables.upsert_rel(rel);
        Ok(())
    }

    async fn unlock_resource(&self, key: &ResourceKey, owner: &str, status: RelStatus) -> Result<bool> {
        let mut tables = self.write()?;
        let owned = tables.locks.get(key).map(|l| l.owner == owner).unwrap_or(false);
        if owned {
            tables.locks.remove(key);
        }
        if let Some(rel) = tables.rel_mut(key, owner) {
            rel.status = status;
            rel.updated_at = Utc::now();
        }
        Ok(owned)
    }

    async fn get_lock(&self, key: &ResourceKey) -> Result<Option<ResourceFlowLock>> {
        Ok(self.query()?.locks.get(key).cloned())
    }

    async fn list_locks(&self, filter: &Expression) -> Result<Vec<ResourceFlowLock>> {
        let mut locks: Vec<_> = self
            .query()?
            .locks
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(locks)
    }

    async fn create_flow_rels(&self, rels: Vec<ResourceFlowRel>) -> Result<()> {
        let mut tables = self.write()?;
        for rel in rels {
            tables.upsert_rel(rel);
        }
        Ok(())
    }

    async fn update_flow_rel_status(&self, key: &ResourceKey, flow_id: &str, status: RelStatus) -> Result<()> {
        let mut tables = self.write()?;
        let rel = tables
            .rel_mut(key, flow_id)
            .ok_or_else(|| EngineError::not_found(RecordKind::FlowRel, format!("{key}@{flow_id}")))?;
        rel.status = status;
        rel.updated_at = Utc::now();
        Ok(())
    }

    async fn list_flow_rels(&self, filter: &Expression) -> Result<Vec<ResourceFlowRel>> {
        Ok(self
            .query()?
            .rels
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn create_details(&self, details: Vec<TaskDetail>) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(dup) = details
            .iter()
            .find(|d| tables.details.iter().any(|existing| existing.id == d.id))
        {
            return Err(EngineError::Conflict(format!("task detail {} already exists", dup.id)));
        }
        tables.details.extend(details);
        Ok(())
    }

    async fn list_details(&self, filter: &Expression) -> Result<Vec<TaskDetail>> {
        Ok(self
            .query()?
            .details
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn update_details(&self, updates: &[TaskDetailUpdate]) -> Result<()> {
        let mut tables = self.write()?;
        let mut positions = Vec::with_capacity(updates.len());
        for update in updates {
            let pos = tables
                .details
                .iter()
                .position(|d| d.id == update.id)
                .ok_or_else(|| EngineError::not_found(RecordKind::TaskDetail, &update.id))?;
            let current = tables.details[pos].state;
            if !update.expected.is_empty() && !update.expected.contains(&current) {
                return Err(EngineError::Conflict(format!(
                    "task detail {} is {}, expected one of {:?}",
                    update.id, current, update.expected
                )));
            }
            positions.push(pos);
        }
        let now = Utc::now();
        for (pos, update) in positions.into_iter().zip(updates) {
            let detail = &mut tables.details[pos];
            detail.state = update.state;
            if let Some(result) = &update.result {
                detail.result = Some(result.clone());
            }
            if let Some(reason) = &update.reason {
                detail.reason = Some(reason.clone());
            }
            detail.updated_at = now;
        }
        Ok(())
    }

    async fn cancel_init_details(&self, management_id: &str) -> Result<usize> {
        let mut tables = self.write()?;
        let now = Utc::now();
        let mut changed = 0;
        for detail in tables
            .details
            .iter_mut()
            .filter(|d| d.management_id == management_id && d.state == DetailState::Init)
        {
            detail.state = DetailState::Cancel;
            detail.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn create_management(&self, management: TaskManagement) -> Result<()> {
        let mut tables = self.write()?;
        if tables.managements.contains_key(&management.id) {
            return Err(EngineError::Conflict(format!(
                "task management {} already exists",
                management.id
            )));
        }
        tables.managements.insert(management.id.clone(), management);
        Ok(())
    }

    async fn get_management(&self, id: &str) -> Result<TaskManagement> {
        self.query()?
            .managements
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(RecordKind::TaskManagement, id))
    }

    async fn update_management_state(&self, id: &str, state: ManagementState) -> Result<()> {
        let mut tables = self.write()?;
        let management = tables
            .managements
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(RecordKind::TaskManagement, id))?;
        management.state = state;
        management.updated_at = Utc::now();
        Ok(())
    }
}
