pub mod adapter;
pub mod composer;
pub mod config;
pub mod dispatcher;
pub mod gate;
pub mod model;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};
use wayfarer_core::{
    BookingRecord, ConsentDecision, ConversationMessage, ConversationSession, FinishReason,
    PaymentAuthorization, Role, ToolCatalog, ToolError, ToolInvocation, WorkflowSequencer,
    WorkflowSnapshot,
};
use wayfarer_observability::{AppMetrics, AuditEvent, EventSink};
use wayfarer_storage::{BookingRepository, SessionRepository};

pub use adapter::{AdapterError, SyntheticInventory, TravelInventory};
pub use composer::{StreamComposer, StreamError};
pub use config::AgentConfig;
pub use dispatcher::{DispatchContext, Dispatcher, SIGNED_OUT_MESSAGE};
pub use gate::{IdentityProvider, SessionGate, StaticIdentityProvider};
pub use model::{
    tool_call, LanguageModel, ModelError, ModelRequest, ModelResponse, ModelStop, ScriptedModel,
    ScriptedStep,
};

pub struct TurnInput {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
    pub gate: SessionGate,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub finish_reason: FinishReason,
    pub steps: usize,
    pub invocations: Vec<ToolInvocation>,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("sign in to view this session")]
    SignedOut,
    #[error("session {0} belongs to another user")]
    Forbidden(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
struct TurnProgress {
    steps: usize,
    invocations: Vec<ToolInvocation>,
}

/// Drives conversation turns: model steps, tool dispatch, streaming and
/// session persistence.
pub struct BookingAgent<M, A, S>
where
    M: LanguageModel,
    A: TravelInventory,
    S: SessionRepository + BookingRepository,
{
    model: Arc<M>,
    dispatcher: Dispatcher<A, S>,
    store: Arc<S>,
    catalog: Arc<ToolCatalog>,
    sequencer: Arc<WorkflowSequencer>,
    events: Arc<dyn EventSink>,
    metrics: Arc<AppMetrics>,
    config: AgentConfig,
}

impl<M, A, S> BookingAgent<M, A, S>
where
    M: LanguageModel,
    A: TravelInventory,
    S: SessionRepository + BookingRepository,
{
    pub fn new(
        model: Arc<M>,
        inventory: Arc<A>,
        store: Arc<S>,
        events: Arc<dyn EventSink>,
        metrics: Arc<AppMetrics>,
        config: AgentConfig,
    ) -> Self {
        let catalog = Arc::new(ToolCatalog::standard());
        let pending_ttl = chrono::Duration::from_std(config.payment_pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(wayfarer_core::workflow::DEFAULT_PENDING_TTL_MINUTES));
        let sequencer = Arc::new(WorkflowSequencer::new(pending_ttl));
        let dispatcher = Dispatcher::new(
            catalog.clone(),
            inventory,
            store.clone(),
            sequencer.clone(),
            events.clone(),
            metrics.clone(),
        );

        Self {
            model,
            dispatcher,
            store,
            catalog,
            sequencer,
            events,
            metrics,
            config,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AppMetrics> {
        &self.metrics
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn dispatcher(&self) -> &Dispatcher<A, S> {
        &self.dispatcher
    }

    pub fn sequencer(&self) -> &WorkflowSequencer {
        &self.sequencer
    }

    /// Runs one turn and writes it to `composer`, always ending the stream
    /// with exactly one finish marker.
    #[instrument(skip(self, input, composer), fields(session_id = %input.session_id))]
    pub async fn run_turn(&self, input: TurnInput, composer: &mut StreamComposer) -> Result<TurnOutcome> {
        let started = Instant::now();
        self.metrics.inc_turn();

        let now = Utc::now();
        let mut session = self.load_or_create(&input.session_id, now).await?;

        if let Err(message) = check_owner(&session, &input.gate) {
            self.metrics.inc_stream_error();
            self.audit(&session.session_id, "turn_rejected", json!({ "reason": message }));
            close_stream(composer, Some(message.clone()), FinishReason::Error).await;
            return Err(anyhow!(message));
        }

        let appended = session.absorb(&input.messages);
        let token = self.sequencer.begin_turn(&session.session_id);
        let mut progress = TurnProgress::default();

        let driven = tokio::time::timeout(
            self.config.turn_timeout,
            self.drive(&mut session, &input.gate, &token, composer, &mut progress),
        )
        .await;
        self.sequencer.finalize_turn(&token);

        let (finish_reason, error_message) = match driven {
            Ok(Ok(reason)) => (reason, None),
            Ok(Err(StreamError::Disconnected)) => {
                self.metrics.inc_stream_error();
                warn!(session_id = %session.session_id, "client disconnected mid-turn");
                close_abandoned_calls(&mut session, "turn aborted before the tool call finished");
                (FinishReason::Error, None)
            }
            Ok(Err(error)) => {
                self.metrics.inc_stream_error();
                warn!(session_id = %session.session_id, error = %error, "turn aborted");
                close_abandoned_calls(&mut session, "turn aborted before the tool call finished");
                (FinishReason::Error, Some(error.to_string()))
            }
            Err(_) => {
                self.metrics.inc_timeout();
                warn!(
                    session_id = %session.session_id,
                    timeout_ms = self.config.turn_timeout.as_millis() as u64,
                    "turn timed out"
                );
                close_abandoned_calls(&mut session, "turn timed out before the tool call finished");
                (FinishReason::Timeout, None)
            }
        };
        close_stream(composer, error_message, finish_reason).await;

        if session.user_id.is_none() {
            session.user_id = input.gate.resolved().map(|identity| identity.user_id.clone());
        }
        session.touch(Utc::now(), self.session_ttl());
        self.store.upsert_session(&session).await?;

        self.metrics.observe_turn_latency(started.elapsed());
        self.audit(
            &session.session_id,
            "turn_finished",
            json!({
                "finish_reason": finish_reason,
                "steps": progress.steps,
                "tool_calls": progress.invocations.len(),
                "appended_messages": appended,
            }),
        );
        info!(
            session_id = %session.session_id,
            finish_reason = ?finish_reason,
            steps = progress.steps,
            tool_calls = progress.invocations.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "turn finished"
        );

        Ok(TurnOutcome {
            session_id: session.session_id,
            finish_reason,
            steps: progress.steps,
            invocations: progress.invocations,
        })
    }

    async fn drive(
        &self,
        session: &mut ConversationSession,
        gate: &SessionGate,
        token: &wayfarer_core::TurnToken,
        composer: &mut StreamComposer,
        progress: &mut TurnProgress,
    ) -> Result<FinishReason, StreamError> {
        let tools = self.catalog.definitions();
        let system_prompt = self.config.rendered_prompt();
        let ctx = DispatchContext { turn: token, gate };

        for _ in 0..self.config.max_steps {
            progress.steps += 1;
            let request = model::ModelRequest {
                system_prompt: system_prompt.clone(),
                messages: session.messages.clone(),
                tools: tools.clone(),
            };
            let response = self
                .model
                .respond(&request)
                .await
                .map_err(|error| StreamError::Model(error.to_string()))?;

            composer.text(&response.text).await?;
            if response.tool_calls.is_empty() {
                if !response.text.is_empty() {
                    session
                        .messages
                        .push(ConversationMessage::assistant(response.text, Vec::new()));
                }
                return Ok(match response.stop {
                    ModelStop::Length => FinishReason::Length,
                    _ => FinishReason::Stop,
                });
            }

            session.messages.push(ConversationMessage::assistant(
                response.text.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                composer.tool_call(call).await?;
                let invocation = self.dispatcher.dispatch(&ctx, call).await;
                session.messages.push(ConversationMessage::tool_result(&invocation));
                progress.invocations.push(invocation.clone());
                composer.tool_result(&invocation).await?;
            }

            if response.stop == ModelStop::Length {
                return Ok(FinishReason::Length);
            }
        }

        Ok(FinishReason::ToolCalls)
    }

    /// Applies the out-of-band consent signal for a pending payment.
    pub async fn apply_consent(
        &self,
        session_id: &str,
        offer_id: &str,
        decision: ConsentDecision,
        gate: &SessionGate,
    ) -> Result<PaymentAuthorization, ToolError> {
        if let Some(session) = self
            .store
            .load_session(session_id)
            .await
            .map_err(|error| ToolError::Upstream(format!("could not load session: {error:#}")))?
        {
            check_owner(&session, gate).map_err(ToolError::Authorization)?;
        }

        let result = self
            .sequencer
            .apply_consent(session_id, offer_id, decision, gate.resolve(), Utc::now());
        self.metrics.inc_consent();
        self.audit(
            session_id,
            "consent_signal",
            json!({
                "offer_id": offer_id,
                "decision": decision,
                "accepted": result.is_ok(),
                "error": result.as_ref().err().map(|error| error.to_string()),
            }),
        );
        result
    }

    pub fn workflow(&self, session_id: &str) -> WorkflowSnapshot {
        self.sequencer.snapshot(session_id, Utc::now())
    }

    /// Workflow snapshot for the caller behind `gate`. A session that has an
    /// owner, or holds someone's reservation, is only visible to that user.
    pub async fn workflow_for(
        &self,
        session_id: &str,
        gate: &SessionGate,
    ) -> std::result::Result<WorkflowSnapshot, AccessError> {
        let stored_owner = self
            .store
            .load_session(session_id)
            .await?
            .and_then(|session| session.user_id);
        let mut owners = self.sequencer.owners(session_id);
        owners.extend(stored_owner);

        if !owners.is_empty() {
            let identity = gate.resolve().ok_or(AccessError::SignedOut)?;
            if owners.iter().any(|owner| owner != &identity.user_id) {
                return Err(AccessError::Forbidden(session_id.to_string()));
            }
        }
        Ok(self.workflow(session_id))
    }

    /// Past bookings of whoever the gate resolves to; `None` when signed out.
    pub async fn past_bookings(&self, gate: &SessionGate) -> Result<Option<Vec<BookingRecord>>> {
        let Some(identity) = gate.resolve() else {
            return Ok(None);
        };
        let bookings = self.store.past_bookings(&identity.user_id).await?;
        Ok(Some(bookings))
    }

    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_expired(now).await?;
        for session_id in &purged {
            self.sequencer.evict(session_id);
        }
        Ok(purged.len())
    }

    async fn load_or_create(&self, session_id: &str, now: DateTime<Utc>) -> Result<ConversationSession> {
        match self.store.load_session(session_id).await? {
            Some(session) if session.expires_at > now => Ok(session),
            expired => {
                // a lapsed session starts over without the old workflow
                if expired.is_some() && self.sequencer.evict(session_id) {
                    info!(session_id, "expired session workflow evicted");
                }
                Ok(ConversationSession::new(session_id, now, self.session_ttl()))
            }
        }
    }

    fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.session_ttl).unwrap_or_else(|_| chrono::Duration::hours(24))
    }

    fn audit(&self, session_id: &str, kind: &str, detail: serde_json::Value) {
        self.events.record(AuditEvent::new(session_id, kind, detail));
    }
}

fn check_owner(session: &ConversationSession, gate: &SessionGate) -> std::result::Result<(), String> {
    let Some(owner) = session.user_id.as_deref() else {
        return Ok(());
    };
    match gate.resolve() {
        Some(identity) if identity.user_id == owner => Ok(()),
        _ => Err(format!(
            "session {} belongs to another user",
            session.session_id
        )),
    }
}

async fn close_stream(composer: &mut StreamComposer, error: Option<String>, reason: FinishReason) {
    if composer.is_finished() {
        return;
    }
    if let Some(message) = error {
        if let Err(send_error) = composer.error(message).await {
            warn!(error = %send_error, "could not deliver stream error event");
        }
    }
    if let Err(send_error) = composer.finish(reason).await {
        warn!(error = %send_error, "could not deliver finish event");
    }
}

/// Gives every tool call of the last assistant message that never got a
/// result a failed one, so the history stays well-formed for the model.
fn close_abandoned_calls(session: &mut ConversationSession, reason: &str) {
    let Some(position) = session
        .messages
        .iter()
        .rposition(|message| message.role == Role::Assistant && !message.tool_calls.is_empty())
    else {
        return;
    };

    let answered: Vec<String> = session.messages[position + 1..]
        .iter()
        .filter_map(|message| message.tool_call_id.clone())
        .collect();
    let abandoned: Vec<_> = session.messages[position]
        .tool_calls
        .iter()
        .filter(|call| !answered.contains(&call.call_id))
        .cloned()
        .collect();

    let now = Utc::now();
    for call in abandoned {
        let invocation = ToolInvocation {
            call_id: call.call_id,
            tool_name: call.name,
            arguments: call.arguments,
            outcome: wayfarer_core::InvocationOutcome::Failed {
                failure: ToolError::Upstream(reason.to_string()).to_failure(),
            },
            started_at: now,
            finished_at: now,
        };
        session.messages.push(ConversationMessage::tool_result(&invocation));
    }
}
