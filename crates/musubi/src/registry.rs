//! Name-keyed lookup of actions and flow templates.

use musubi_core::{Action, ActionName, EngineError, FlowTemplate, RecordKind, Result, RollbackAction};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// A registered action and, if it has one, its rollback capability.
#[derive(Clone)]
pub struct RegisteredAction {
    action: Arc<dyn Action>,
    rollback: Option<Arc<dyn RollbackAction>>,
}

impl RegisteredAction {
    /// Returns the forward action.
    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }

    /// Returns the rollback capability, if the action was registered with one.
    pub fn rollback(&self) -> Option<&Arc<dyn RollbackAction>> {
        self.rollback.as_ref()
    }
}

impl fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("name", &self.action.name())
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

/// Registry of actions and templates, built once at startup and shared.
///
/// Registering a name twice replaces the earlier entry.
///
/// # Examples
///
/// ```
/// use musubi::{FlowTemplate, Registry, TaskTemplate};
///
/// let registry = Registry::new();
/// registry
///     .register_template(FlowTemplate::new("noop_flow").task(TaskTemplate::new("1", "noop")))
///     .expect("valid template");
/// assert!(registry.get_template("noop_flow").is_some());
/// ```
#[derive(Default)]
pub struct Registry {
    actions: RwLock<HashMap<ActionName, RegisteredAction>>,
    templates: RwLock<HashMap<String, FlowTemplate>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("actions", &self.action_names())
            .field("templates", &self.template_names())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action without rollback.
    pub fn register<A: Action + 'static>(&self, action: A) {
        self.insert(RegisteredAction {
            action: Arc::new(action),
            rollback: None,
        });
    }

    /// Registers an action the engine may roll back.
    pub fn register_with_rollback<A: RollbackAction + 'static>(&self, action: A) {
        let action = Arc::new(action);
        self.insert(RegisteredAction {
            action: action.clone(),
            rollback: Some(action),
        });
    }

    /// Registers an already shared action.
    pub fn register_shared(&self, action: Arc<dyn Action>) {
        self.insert(RegisteredAction {
            action,
            rollback: None,
        });
    }

    fn insert(&self, entry: RegisteredAction) {
        let name = entry.action.name();
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        if actions.insert(name.clone(), entry).is_some() {
            warn!(action = %name, "action registered twice, replacing earlier registration");
        } else {
            debug!(action = %name, "action registered");
        }
    }

    /// Returns the action registered under `name`, if any.
    pub fn get_action(&self, name: &str) -> Option<RegisteredAction> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Like [`Self::get_action`], but a missing action is an error.
    pub fn require_action(&self, name: &str) -> Result<RegisteredAction> {
        self.get_action(name)
            .ok_or_else(|| EngineError::not_found(RecordKind::Action, name))
    }

    /// Returns `true` if an action is registered under `name`.
    pub fn has_action(&self, name: &str) -> bool {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Returns the registered action names, sorted.
    pub fn action_names(&self) -> Vec<ActionName> {
        let mut names: Vec<_> = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Validates and registers a template.
    pub fn register_template(&self, template: FlowTemplate) -> Result<()> {
        template.validate()?;
        let mut templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        let name = template.name.clone();
        if templates.insert(name.clone(), template).is_some() {
            warn!(template = %name, "template registered twice, replacing earlier registration");
        } else {
            debug!(template = %name, "template registered");
        }
        Ok(())
    }

    /// Returns a copy of the template registered under `name`, if any.
    pub fn get_template(&self, name: &str) -> Option<FlowTemplate> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns the registered template names, sorted.
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
