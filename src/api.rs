use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;

use crate::ipc::{self, AppState, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

/// Identity attached to every room-scoped request.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
}

impl Actor {
    pub fn teacher(user_id: &str, user_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            role: Role::Teacher,
        }
    }

    pub fn student(user_id: &str, user_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            role: Role::Student,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "userId": self.user_id,
            "userName": self.user_name,
            "role": self.role.as_str(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum ApiError {
    /// Network-level failure; the request may or may not have been applied.
    /// Callers keep their cached view and retry later.
    Transient(String),
    /// The server handled the request and refused it.
    Rejected { code: String, message: String },
}

impl ApiError {
    pub fn code(&self) -> &str {
        match self {
            ApiError::Transient(_) => "transient",
            ApiError::Rejected { code, .. } => code,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transient(m) => write!(f, "transient failure: {}", m),
            ApiError::Rejected { code, message } => write!(f, "{}: {}", code, message),
        }
    }
}

/// The persistence boundary the client engines talk through. One method,
/// same `{method, params}` shape as the wire protocol, so an in-process
/// workspace and a remote sidecar are interchangeable behind it.
pub trait Api {
    fn call(&mut self, method: &str, params: serde_json::Value)
        -> Result<serde_json::Value, ApiError>;
}

/// In-process implementation routing straight through the request router.
/// Clones share one workspace, which is how tests put a teacher client and
/// several student clients in front of the same server state.
#[derive(Clone)]
pub struct LocalApi {
    state: Rc<RefCell<AppState>>,
    next_id: Rc<RefCell<u64>>,
}

impl LocalApi {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Rc::new(RefCell::new(state)),
            next_id: Rc::new(RefCell::new(0)),
        }
    }

    /// Workspace-less API over an in-memory database; the server half of
    /// client-core tests.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(AppState {
            workspace: None,
            db: Some(crate::db::open_in_memory()),
        })
    }
}

impl Api for LocalApi {
    fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        let id = {
            let mut n = self.next_id.borrow_mut();
            *n += 1;
            n.to_string()
        };
        let req = Request {
            id,
            method: method.to_string(),
            params,
        };
        let resp = ipc::handle_request(&mut self.state.borrow_mut(), &req);
        if resp.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(resp.get("result").cloned().unwrap_or(serde_json::Value::Null));
        }
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let message = resp
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Err(ApiError::Rejected { code, message })
    }
}
