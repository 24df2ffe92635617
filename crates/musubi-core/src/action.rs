use crate::context::ExecuteContext;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Globally unique name an [`Action`] is registered under.
///
/// # Examples
///
/// ```
/// use musubi_core::ActionName;
///
/// let name = ActionName::new("create_load_balancer");
/// assert_eq!(name.as_str(), "create_load_balancer");
///
/// let name: ActionName = "flow_watch".into();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionName(String);

impl ActionName {
    /// Creates a new ActionName
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the action name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a task inside one flow instance.
///
/// Unique within a flow, not globally; dependencies refer to tasks by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Creates a new ActionId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_newtype_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype_impls!(ActionName);
string_newtype_impls!(ActionId);

/// A named, stateless unit of work the engine dispatches tasks to.
///
/// Actions are registered once at startup and shared across every flow, so
/// any collaborator they need (clients, a [`Store`](crate::Store)) is injected
/// at construction time.
///
/// # Examples
///
/// ```
/// use musubi_core::{Action, ActionName, ExecuteContext, Result};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// #[derive(Debug)]
/// struct CreateSubnet;
///
/// #[async_trait]
/// impl Action for CreateSubnet {
///     fn name(&self) -> ActionName {
///         ActionName::new("create_subnet")
///     }
///
///     async fn run(&self, ctx: &ExecuteContext, params: Value) -> Result<Value> {
///         ctx.share_data().set("subnet_id", "subnet-1").await?;
///         Ok(json!({ "cidr": params["cidr"] }))
///     }
/// }
/// ```
#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    /// Name this action is registered and looked up under.
    fn name(&self) -> ActionName;

    /// Executes the action.
    async fn run(&self, ctx: &ExecuteContext, params: Value) -> Result<Value>;

    /// Decodes the raw task payload before [`Action::run`] sees it.
    ///
    /// The default passes the payload through unchanged.
    fn new_params(&self, raw: Value) -> Result<Value> {
        Ok(raw)
    }
}

/// Optional extension for actions that can undo their side effects.
///
/// Register such actions with `Registry::register_with_rollback` so the engine
/// can offer them a rollback when their flow fails.
#[async_trait]
pub trait RollbackAction: Action {
    /// Reverts whatever [`Action::run`] did for `params`.
    async fn rollback(&self, ctx: &ExecuteContext, params: Value) -> Result<()>;
}

/// Decodes a task payload into a typed parameter struct.
///
/// Decoding failures are reported as [`EngineError::InvalidParameter`].
pub fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| EngineError::InvalidParameter(format!("decode params failed: {e}")))
}
