//! Diagnostic sessions: correlation contexts grouping command exchanges.
//!
//! A session moves from `active` to exactly one terminal status
//! (`completed`, `cancelled` or `expired`) and never transitions again.
//! Only the background sweeper demotes overdue sessions to `expired`;
//! terminal records stay readable for a retention window before the
//! sweeper removes them.

use nanoid::nanoid;
use rtk_api::clock::Clock;
use serde_json::Map;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Active sessions beyond this cap are refused.
    pub max_concurrent: usize,

    /// Inactivity budget of a session; activity renews it.
    pub timeout: Duration,

    /// Period of the background sweeper.
    pub cleanup_interval: Duration,

    /// How long terminal sessions stay readable before removal.
    pub cleanup_grace: Duration,

    /// Whether the sweeper runs at all.
    pub auto_cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_concurrent: 100,
            timeout: Duration::from_secs(15 * 60),
            cleanup_interval: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(5 * 60),
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// One command exchange recorded under a session. Append-only: a record is
/// completed at most once.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub op: String,
    pub args: JsonValue,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<bool>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl ToolCall {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub intent: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    pub tool_calls: Vec<ToolCall>,
    pub metadata: Map<String, JsonValue>,
}

/// Parameters of a new session.
#[derive(Debug, Default)]
pub struct NewSession {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub intent: Option<String>,

    /// Overrides the configured session timeout.
    pub timeout: Option<Duration>,

    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session cap of {max} concurrent active sessions exceeded")]
    CapExceeded { max: usize },

    #[error("No such session: {id}")]
    NotFound { id: String },

    #[error("Session {id} is already {status:?}")]
    AlreadyTerminal { id: String, status: SessionStatus },

    #[error("Tool call {call_id} of session {session_id} is already completed")]
    ToolCallAlreadyCompleted { session_id: String, call_id: String },

    #[error("No tool call {call_id} in session {session_id}")]
    ToolCallNotFound { session_id: String, call_id: String },
}

/// What one sweeper pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub removed: Vec<String>,
}

/// The owner of all sessions and their tool-call records.
///
/// A single writer lock guards the table; reads take the shared side.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a new session, subject to the concurrency cap.
    pub fn create(&self, new: NewSession) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().unwrap();

        let active = sessions
            .values()
            .filter(|session| session.status == SessionStatus::Active)
            .count();
        if active >= self.config.max_concurrent {
            return Err(SessionError::CapExceeded {
                max: self.config.max_concurrent,
            });
        }

        let now = self.clock.now_millis();
        let timeout = new.timeout.unwrap_or(self.config.timeout);
        let session = Session {
            id: nanoid!(),
            user_id: new.user_id,
            device_id: new.device_id,
            intent: new.intent,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: now + timeout.as_millis() as i64,
            tool_calls: vec![],
            metadata: new.metadata,
        };
        debug!(session = %session.id, "session created");
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| session.status == SessionStatus::Active)
            .count()
    }

    /// Complete an active session.
    pub fn complete(&self, id: &str) -> Result<Session, SessionError> {
        self.transition(id, SessionStatus::Completed)
    }

    /// Cancel an active session.
    ///
    /// Returns the ids of its open tool calls: the caller is expected to
    /// cancel the corresponding in-flight commands in turn.
    pub fn cancel(&self, id: &str) -> Result<Vec<String>, SessionError> {
        let session = self.transition(id, SessionStatus::Cancelled)?;
        Ok(session
            .tool_calls
            .iter()
            .filter(|call| call.is_open())
            .map(|call| call.id.clone())
            .collect())
    }

    fn transition(&self, id: &str, target: SessionStatus) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })?;
        if session.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                id: id.to_string(),
                status: session.status,
            });
        }
        session.status = target;
        session.updated_at = self.clock.now_millis();
        debug!(session = %session.id, status = ?target, "session closed");
        Ok(session.clone())
    }

    /// Record the start of a command exchange under an active session.
    /// Activity renews the session's expiry.
    pub fn start_tool_call(
        &self,
        session_id: &str,
        call_id: impl Into<String>,
        op: impl Into<String>,
        args: JsonValue,
    ) -> Result<ToolCall, SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })?;
        if session.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                id: session_id.to_string(),
                status: session.status,
            });
        }

        let now = self.clock.now_millis();
        let call = ToolCall {
            id: call_id.into(),
            op: op.into(),
            args,
            started_at: now,
            completed_at: None,
            success: None,
            result: None,
            error: None,
        };
        session.tool_calls.push(call.clone());
        session.updated_at = now;
        session.expires_at = now + self.config.timeout.as_millis() as i64;
        Ok(call)
    }

    /// Fill in the outcome of a tool call, exactly once.
    pub fn complete_tool_call(
        &self,
        session_id: &str,
        call_id: &str,
        success: bool,
        result: Option<JsonValue>,
        error: Option<String>,
    ) -> Result<ToolCall, SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })?;
        let call = session
            .tool_calls
            .iter_mut()
            .find(|call| call.id == call_id)
            .ok_or_else(|| SessionError::ToolCallNotFound {
                session_id: session_id.to_string(),
                call_id: call_id.to_string(),
            })?;

        if call.completed_at.is_some() {
            return Err(SessionError::ToolCallAlreadyCompleted {
                session_id: session_id.to_string(),
                call_id: call_id.to_string(),
            });
        }

        let now = self.clock.now_millis();
        call.completed_at = Some(now);
        call.success = Some(success);
        call.result = result;
        call.error = error;
        let call = call.clone();
        session.updated_at = now;
        Ok(call)
    }

    /// One sweeper pass: expire overdue active sessions, drop terminal
    /// ones past their retention window.
    ///
    /// This is the only place an `active` session becomes `expired`.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let grace = self.config.cleanup_grace.as_millis() as i64;
        let mut sessions = self.sessions.write().unwrap();
        let mut report = SweepReport::default();

        for session in sessions.values_mut() {
            if session.status == SessionStatus::Active && now > session.expires_at {
                session.status = SessionStatus::Expired;
                session.updated_at = now;
                report.expired.push(session.id.clone());
            }
        }

        sessions.retain(|id, session| {
            let retain = !session.status.is_terminal()
                || now <= session.expires_at.max(session.updated_at) + grace;
            if !retain {
                report.removed.push(id.clone());
            }
            retain
        });

        if !report.expired.is_empty() || !report.removed.is_empty() {
            info!(
                expired = report.expired.len(),
                removed = report.removed.len(),
                "session sweep"
            );
        }
        report
    }

    /// Run the sweeper on its configured interval until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                }
            }
        })
    }
}
