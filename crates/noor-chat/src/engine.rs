//! Chat engine: the request lifecycle controller.
//!
//! Owns the conversation store and the quota tracker behind one lock,
//! enforces a single in-flight request across all conversations, and applies
//! decoded stream events to the store as they arrive. Cancellation is
//! cooperative: every event is applied under the lock only after checking the
//! flight's token, so nothing arriving after [`ChatEngine::stop`] can mutate
//! state.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use noor_core::config::ChatConfig;
use noor_core::events::EngineNotice;
use noor_core::types::{Conversation, Message, QuotaState, SourceFilter, StreamEvent, UserProfile};

use crate::decoder::{decode_stream, DecodeMode, StreamDecoder};
use crate::error::ChatError;
use crate::quota::QuotaTracker;
use crate::session::{MemorySessionStore, SessionStore};
use crate::store::ConversationStore;
use crate::transport::{AskRequest, AskTransport, TransportError};

/// Text left in place of an answer when the service could not be reached or
/// the stream broke off.
pub const NETWORK_ERROR_TEXT: &str =
    "Désolé, une erreur est survenue. Vérifiez que le serveur est lancé.";

/// Text left in place of an answer the service failed to generate.
pub fn generation_error_text(message: &str) -> String {
    format!("Erreur: {}", message)
}

/// How an accepted [`ChatEngine::send`] call ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The answer streamed to its end.
    Completed,
    /// [`ChatEngine::stop`] ended the request; partial content was kept.
    Cancelled,
    /// Another request was in flight; nothing was appended.
    Busy,
}

/// The request currently streaming.
#[derive(Debug, Clone)]
struct Flight {
    id: u64,
    token: CancellationToken,
    conversation_id: String,
    user_message_id: String,
    assistant_message_id: String,
}

#[derive(Debug)]
struct EngineState {
    store: ConversationStore,
    quota: QuotaTracker,
    flight: Option<Flight>,
    next_flight_id: u64,
}

/// Streaming conversation engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatEngine {
    state: Arc<Mutex<EngineState>>,
    transport: Arc<dyn AskTransport>,
    session: Arc<dyn SessionStore>,
    notices: Option<UnboundedSender<EngineNotice>>,
    config: Arc<ChatConfig>,
}

impl ChatEngine {
    /// Create an engine with an in-memory session, no notice channel and the
    /// default quota.
    pub fn new(transport: Arc<dyn AskTransport>, config: ChatConfig) -> Self {
        let state = EngineState {
            store: ConversationStore::new(config.title_max_chars),
            quota: QuotaTracker::default(),
            flight: None,
            next_flight_id: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            transport,
            session: Arc::new(MemorySessionStore::new()),
            notices: None,
            config: Arc::new(config),
        }
    }

    /// Use `session` to remember the active conversation.
    pub fn with_session(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = session;
        self
    }

    /// Deliver [`EngineNotice`]s on `sender`.
    pub fn with_notices(mut self, sender: UnboundedSender<EngineNotice>) -> Self {
        self.notices = Some(sender);
        self
    }

    /// Replace the quota estimate.
    pub fn with_quota(self, quota: QuotaTracker) -> Self {
        self.lock().quota = quota;
        self
    }

    // -- Reads --

    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().store.conversations().to_vec()
    }

    pub fn current_conversation(&self) -> Conversation {
        self.lock().store.current().clone()
    }

    pub fn current_messages(&self) -> Vec<Message> {
        self.lock().store.current_messages().to_vec()
    }

    pub fn active_id(&self) -> String {
        self.lock().store.active_id().to_string()
    }

    /// Whether a request is in flight.
    pub fn is_streaming(&self) -> bool {
        self.lock().flight.is_some()
    }

    pub fn quota(&self) -> QuotaState {
        self.lock().quota.state()
    }

    pub fn is_limit_reached(&self) -> bool {
        !self.lock().quota.has_capacity()
    }

    // -- Conversation entry points --

    /// Switch to an empty conversation, reusing one if it exists.
    pub fn new_chat(&self) -> String {
        let id = self.lock().store.new_chat().to_string();
        self.remember_active(&id);
        id
    }

    pub fn select_conversation(&self, id: &str) -> Result<(), ChatError> {
        self.lock().store.select_conversation(id)?;
        self.remember_active(id);
        Ok(())
    }

    /// Delete a conversation. Deleting the one being streamed into stops
    /// that request first.
    pub fn delete_conversation(&self, id: &str) -> Result<(), ChatError> {
        let active = {
            let mut state = self.lock();
            if !state.store.contains(id) {
                return Err(ChatError::ConversationNotFound(id.to_string()));
            }
            if state
                .flight
                .as_ref()
                .is_some_and(|f| f.conversation_id == id)
            {
                if let Some(flight) = state.flight.take() {
                    flight.token.cancel();
                    tracing::info!(conversation_id = %id, "Stopped request of deleted conversation");
                }
            }
            state.store.delete_conversation(id)?;
            state.store.active_id().to_string()
        };
        self.remember_active(&active);
        Ok(())
    }

    /// Seed the store from the service's history.
    ///
    /// Returns the number of turns received. The remembered active
    /// conversation is restored when it still exists.
    pub async fn load_history(&self) -> Result<usize, ChatError> {
        let turns = match self.transport.history().await {
            Ok(turns) => turns,
            Err(TransportError::Unauthorized) => {
                self.notify(EngineNotice::AuthRequired);
                return Err(ChatError::Unauthenticated);
            }
            Err(e) => {
                tracing::warn!(error = %e, "History fetch failed");
                return Err(e.into());
            }
        };

        let count = turns.len();
        let remembered = self.session.load_active_id();
        let active = {
            let mut state = self.lock();
            state.store.reconcile_history(turns, remembered.as_deref());
            state.store.active_id().to_string()
        };
        self.remember_active(&active);
        Ok(count)
    }

    /// Replace the quota estimate with a server-confirmed profile.
    pub fn reconcile_quota(&self, profile: &UserProfile) {
        self.lock()
            .quota
            .reconcile(profile, Local::now().date_naive());
    }

    // -- Requests --

    /// Ask `question` in the active conversation and stream the answer into
    /// it.
    ///
    /// Resolves when the request reaches a terminal state. Returns
    /// `Ok(SendOutcome::Busy)` without touching anything while another
    /// request is in flight.
    pub async fn send(
        &self,
        question: &str,
        filter: SourceFilter,
    ) -> Result<SendOutcome, ChatError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let max = self.config.max_question_chars;
        if question.chars().count() > max {
            return Err(ChatError::MessageTooLong(max));
        }

        let Some(flight) = self.begin(question)? else {
            return Ok(SendOutcome::Busy);
        };
        let guard = FlightGuard {
            engine: self,
            flight,
        };

        let request = AskRequest {
            q: question.to_string(),
            limit: self.config.source_limit,
            source_filter: filter,
        };
        self.run(&guard.flight, &request).await
    }

    /// Cancel the in-flight request, keeping the content received so far.
    ///
    /// Returns whether a request was stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        let Some(flight) = state.flight.take() else {
            return false;
        };
        flight.token.cancel();
        state.store.finalize(
            &flight.conversation_id,
            &flight.assistant_message_id,
            None,
        );
        tracing::info!(conversation_id = %flight.conversation_id, "Request stopped");
        true
    }

    /// Accept a request: check single-flight and quota, then append the
    /// optimistic turn.
    fn begin(&self, question: &str) -> Result<Option<Flight>, ChatError> {
        let mut state = self.lock();
        if state.flight.is_some() {
            tracing::debug!("Send ignored, a request is already in flight");
            return Ok(None);
        }
        if !state.quota.has_capacity() {
            let reset_time = state.quota.reset_time();
            drop(state);
            tracing::info!(reset_time = %reset_time, "Send refused, daily limit reached");
            self.notify(EngineNotice::LimitReached {
                reset_time: reset_time.clone(),
            });
            return Err(ChatError::LimitReached {
                reset_time: Some(reset_time),
            });
        }

        let conversation_id = state.store.active_id().to_string();
        let user = Message::user(question);
        let assistant = Message::assistant_placeholder();
        let flight = Flight {
            id: state.next_flight_id,
            token: CancellationToken::new(),
            conversation_id: conversation_id.clone(),
            user_message_id: user.id.clone(),
            assistant_message_id: assistant.id.clone(),
        };
        state.store.append_turn(&conversation_id, user, assistant)?;
        state.next_flight_id += 1;
        state.flight = Some(flight.clone());
        drop(state);

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %flight.assistant_message_id,
            "Request started"
        );
        self.notify(EngineNotice::StreamStarted { conversation_id });
        Ok(Some(flight))
    }

    async fn run(&self, flight: &Flight, request: &AskRequest) -> Result<SendOutcome, ChatError> {
        let opened = tokio::select! {
            _ = flight.token.cancelled() => return Ok(SendOutcome::Cancelled),
            opened = self.transport.ask_stream(request) => opened,
        };
        let body = match opened {
            Ok(body) => body,
            Err(e) => return self.fail_before_stream(flight, e),
        };

        let mut events = Box::pin(decode_stream(body, self.decoder()));
        loop {
            let item = tokio::select! {
                _ = flight.token.cancelled() => return Ok(SendOutcome::Cancelled),
                item = events.next() => item,
            };
            if let ControlFlow::Break(outcome) = self.apply(flight, item) {
                return outcome;
            }
        }
    }

    /// Apply one decoded item. Breaks with the request's outcome on a
    /// terminal item.
    fn apply(
        &self,
        flight: &Flight,
        item: Option<Result<StreamEvent, ChatError>>,
    ) -> ControlFlow<Result<SendOutcome, ChatError>> {
        let mut state = self.lock();
        if flight.token.is_cancelled() {
            return ControlFlow::Break(Ok(SendOutcome::Cancelled));
        }
        let conv = flight.conversation_id.as_str();
        let msg = flight.assistant_message_id.as_str();

        match item {
            Some(Ok(StreamEvent::Sources(sources))) => {
                tracing::debug!(conversation_id = %conv, count = sources.len(), "Sources received");
                state.store.apply_sources(conv, msg, sources);
                ControlFlow::Continue(())
            }
            Some(Ok(StreamEvent::Token(token))) => {
                state.store.append_token(conv, msg, &token);
                ControlFlow::Continue(())
            }
            Some(Ok(StreamEvent::Done)) => {
                state.store.finalize(conv, msg, None);
                state.quota.record_success();
                tracing::info!(conversation_id = %conv, message_id = %msg, "Answer complete");
                ControlFlow::Break(Ok(SendOutcome::Completed))
            }
            Some(Ok(StreamEvent::Error {
                message,
                error_code,
                reset_time,
            })) => {
                if error_code.as_deref().is_some_and(|c| self.is_limit_code(c)) {
                    let err = self.retract_for_limit(&mut state, flight, reset_time);
                    return ControlFlow::Break(Err(err));
                }
                tracing::warn!(conversation_id = %conv, error = %message, "Generation failed");
                state
                    .store
                    .finalize(conv, msg, Some(&generation_error_text(&message)));
                ControlFlow::Break(Err(ChatError::Generation(message)))
            }
            Some(Err(e)) => {
                tracing::warn!(conversation_id = %conv, error = %e, "Answer stream failed");
                state.store.finalize(conv, msg, Some(NETWORK_ERROR_TEXT));
                ControlFlow::Break(Err(e))
            }
            None => {
                tracing::warn!(conversation_id = %conv, "Answer stream ended without a terminal event");
                state.store.finalize(conv, msg, Some(NETWORK_ERROR_TEXT));
                ControlFlow::Break(Err(ChatError::IncompleteStream))
            }
        }
    }

    fn fail_before_stream(
        &self,
        flight: &Flight,
        err: TransportError,
    ) -> Result<SendOutcome, ChatError> {
        let mut state = self.lock();
        if flight.token.is_cancelled() {
            return Ok(SendOutcome::Cancelled);
        }
        let conv = flight.conversation_id.as_str();

        match err {
            TransportError::Unauthorized => {
                state.store.retract_turn(
                    conv,
                    &flight.user_message_id,
                    &flight.assistant_message_id,
                );
                drop(state);
                tracing::info!(conversation_id = %conv, "Request rejected, authentication required");
                self.notify(EngineNotice::AuthRequired);
                Err(ChatError::Unauthenticated)
            }
            TransportError::Forbidden {
                message,
                reset_time,
            } => {
                tracing::debug!(conversation_id = %conv, message = %message, "Request forbidden");
                Err(self.retract_for_limit(&mut state, flight, reset_time))
            }
            other => {
                tracing::warn!(conversation_id = %conv, error = %other, "Request failed");
                state
                    .store
                    .finalize(conv, &flight.assistant_message_id, Some(NETWORK_ERROR_TEXT));
                Err(other.into())
            }
        }
    }

    /// Remove the optimistic turn and mark the quota exhausted.
    fn retract_for_limit(
        &self,
        state: &mut EngineState,
        flight: &Flight,
        reset_time: Option<String>,
    ) -> ChatError {
        state.store.retract_turn(
            &flight.conversation_id,
            &flight.user_message_id,
            &flight.assistant_message_id,
        );
        state.quota.force_exhausted(reset_time.clone());
        let shown = state.quota.reset_time();
        tracing::info!(
            conversation_id = %flight.conversation_id,
            reset_time = %shown,
            "Request refused, daily limit reached"
        );
        self.notify(EngineNotice::LimitReached { reset_time: shown });
        ChatError::LimitReached { reset_time }
    }

    /// Clear the flight if it is still `flight`. A stale flight finalizes
    /// nothing a newer request owns.
    fn release(&self, flight: &Flight) {
        let mut state = self.lock();
        if state.flight.as_ref().is_some_and(|f| f.id == flight.id) {
            state.flight = None;
            state.store.finalize(
                &flight.conversation_id,
                &flight.assistant_message_id,
                None,
            );
        }
    }

    fn is_limit_code(&self, code: &str) -> bool {
        self.config.limit_error_codes.iter().any(|c| c == code)
    }

    fn decoder(&self) -> StreamDecoder {
        let mode = if self.config.strict_decoding {
            DecodeMode::Strict
        } else {
            DecodeMode::Lenient
        };
        StreamDecoder::new(mode).with_max_line_bytes(self.config.max_line_bytes)
    }

    /// Persist the active conversation id. A failed write leaves the
    /// in-memory selection in place; only the next launch loses it.
    fn remember_active(&self, id: &str) {
        if let Err(e) = self.session.save_active_id(id) {
            tracing::warn!(conversation_id = %id, error = %e, "Failed to save session");
        }
    }

    fn notify(&self, notice: EngineNotice) {
        if let Some(sender) = &self.notices {
            if sender.send(notice).is_err() {
                tracing::debug!("Notice receiver closed");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Engine state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Releases the flight however `send` ends, including when its future is
/// dropped mid-stream.
struct FlightGuard<'a> {
    engine: &'a ChatEngine,
    flight: Flight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.engine.release(&self.flight);
        self.engine.notify(EngineNotice::StreamFinished {
            conversation_id: self.flight.conversation_id.clone(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use futures::channel::mpsc as chunk_channel;
    use futures::stream;
    use tokio::sync::mpsc;

    use noor_core::types::{HistoryTurn, Role, SubscriptionPlan, DEFAULT_TITLE};

    use crate::transport::ByteStream;

    const SCENARIO: &str = concat!(
        r#"{"type":"sources","data":[{"reference":"2:185","text_ar":"...","text_fr":"..."}]}"#,
        "\n",
        r#"{"type":"token","data":"Le "}"#,
        "\n",
        r#"{"type":"token","data":"jeûne"}"#,
        "\n",
        r#"{"type":"done"}"#,
        "\n",
    );

    type ChunkSender = chunk_channel::UnboundedSender<Result<Bytes, TransportError>>;

    enum Reply {
        Chunks(Vec<Result<Bytes, TransportError>>),
        Live(chunk_channel::UnboundedReceiver<Result<Bytes, TransportError>>),
        Fail(TransportError),
    }

    /// Transport answering each request with the next scripted reply.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<AskRequest>>,
        history: Mutex<Option<Result<Vec<HistoryTurn>, TransportError>>>,
    }

    impl ScriptedTransport {
        fn push(&self, reply: Reply) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn body(&self, text: &str) {
            self.push(Reply::Chunks(vec![Ok(Bytes::from(text.to_string()))]));
        }

        fn live(&self) -> ChunkSender {
            let (tx, rx) = chunk_channel::unbounded();
            self.push(Reply::Live(rx));
            tx
        }

        fn set_history(&self, result: Result<Vec<HistoryTurn>, TransportError>) {
            *self.history.lock().unwrap() = Some(result);
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AskTransport for ScriptedTransport {
        async fn ask_stream(&self, request: &AskRequest) -> Result<ByteStream, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Chunks(chunks)) => Ok(Box::pin(stream::iter(chunks))),
                Some(Reply::Live(rx)) => Ok(Box::pin(rx)),
                Some(Reply::Fail(e)) => Err(e),
                None => Err(TransportError::Network("no scripted reply".to_string())),
            }
        }

        async fn history(&self) -> Result<Vec<HistoryTurn>, TransportError> {
            self.history
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn engine() -> (ChatEngine, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::default());
        let engine = ChatEngine::new(transport.clone(), ChatConfig::default());
        (engine, transport)
    }

    fn engine_with_notices() -> (
        ChatEngine,
        Arc<ScriptedTransport>,
        mpsc::UnboundedReceiver<EngineNotice>,
    ) {
        let (engine, transport) = engine();
        let (tx, rx) = mpsc::unbounded_channel();
        (engine.with_notices(tx), transport, rx)
    }

    fn chunk(text: &str) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(text.to_string()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineNotice>) -> Vec<EngineNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            out.push(notice);
        }
        out
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ---- Streaming ----

    #[tokio::test]
    async fn test_scenario_stream_builds_answer() {
        let (engine, transport) = engine();
        transport.body(SCENARIO);

        let outcome = engine.send("  Le jeûne ?  ", SourceFilter::Quran).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);

        let messages = engine.current_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Le jeûne ?");
        assert_eq!(messages[1].content, "Le jeûne");
        assert!(!messages[1].is_streaming);
        assert_eq!(messages[1].sources.as_ref().unwrap().len(), 1);
        assert!(!engine.is_streaming());
        assert_eq!(engine.quota().used_today, 1);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].q, "Le jeûne ?");
        assert_eq!(requests[0].limit, 5);
        assert_eq!(requests[0].source_filter, SourceFilter::Quran);
    }

    #[tokio::test]
    async fn test_arbitrary_chunking_gives_same_answer() {
        let (engine, transport) = engine();
        let bytes = SCENARIO.as_bytes();
        let chunks = bytes
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        transport.push(Reply::Chunks(chunks));

        engine.send("q", SourceFilter::Both).await.unwrap();
        assert_eq!(engine.current_messages()[1].content, "Le jeûne");
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped_by_default() {
        let (engine, transport) = engine();
        transport.body("garbage\n{\"type\":\"token\",\"data\":\"ok\"}\n{oops\n{\"type\":\"done\"}\n");

        let outcome = engine.send("q", SourceFilter::Both).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(engine.current_messages()[1].content, "ok");
    }

    #[tokio::test]
    async fn test_strict_decoding_fails_on_malformed_line() {
        let transport = Arc::new(ScriptedTransport::default());
        let config = ChatConfig {
            strict_decoding: true,
            ..ChatConfig::default()
        };
        let engine = ChatEngine::new(transport.clone(), config);
        transport.body("{\"type\":\"token\",\"data\":\"a\"}\nnot json\n{\"type\":\"done\"}\n");

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::MalformedEvent(_)));
        let messages = engine.current_messages();
        assert_eq!(messages[1].content, NETWORK_ERROR_TEXT);
        assert!(!messages[1].is_streaming);
    }

    #[tokio::test]
    async fn test_oversized_line_dropped_per_config() {
        let transport = Arc::new(ScriptedTransport::default());
        let config = ChatConfig {
            max_line_bytes: 64,
            ..ChatConfig::default()
        };
        let engine = ChatEngine::new(transport.clone(), config);
        let long = format!("{{\"type\":\"token\",\"data\":\"{}\"}}\n", "z".repeat(200));
        transport.body(&format!(
            "{{\"type\":\"token\",\"data\":\"ok\"}}\n{}{{\"type\":\"done\"}}\n",
            long
        ));

        let outcome = engine.send("q", SourceFilter::Both).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(engine.current_messages()[1].content, "ok");
    }

    #[tokio::test]
    async fn test_two_sends_keep_order_and_title() {
        let (engine, transport) = engine();
        transport.body(SCENARIO);
        transport.body("{\"type\":\"token\",\"data\":\"Oui\"}\n{\"type\":\"done\"}\n");

        let first = "Quelles sont les règles du jeûne pendant le Ramadan ?";
        engine.send(first, SourceFilter::Both).await.unwrap();
        let title = engine.current_conversation().title;
        engine.send("Et en voyage ?", SourceFilter::Both).await.unwrap();

        let conv = engine.current_conversation();
        let roles: Vec<Role> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(conv.title, title);
        assert_eq!(conv.title, "Quelles sont les règles du jeûne pendant…");
        assert_eq!(engine.quota().used_today, 2);
    }

    // ---- Single flight and stop ----

    #[tokio::test]
    async fn test_send_while_streaming_is_noop() {
        let (engine, transport, mut notices) = engine_with_notices();
        let tx = transport.live();

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.send("first", SourceFilter::Both).await }
        });
        let started = notices.recv().await.unwrap();
        assert!(matches!(started, EngineNotice::StreamStarted { .. }));

        let outcome = engine.send("second", SourceFilter::Both).await.unwrap();
        assert_eq!(outcome, SendOutcome::Busy);
        assert_eq!(engine.current_messages().len(), 2);
        assert_eq!(transport.request_count(), 1);

        tx.unbounded_send(chunk("{\"type\":\"done\"}\n")).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Completed);
        assert!(!engine.is_streaming());
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_content_and_ignores_late_chunks() {
        let (engine, transport, mut notices) = engine_with_notices();
        let tx = transport.live();

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.send("q", SourceFilter::Both).await }
        });
        notices.recv().await.unwrap();

        tx.unbounded_send(chunk("{\"type\":\"token\",\"data\":\"Le \"}\n"))
            .unwrap();
        wait_until(|| engine.current_messages()[1].content == "Le ").await;

        assert!(engine.stop());
        let messages = engine.current_messages();
        assert!(!messages[1].is_streaming);
        assert!(!engine.is_streaming());

        let _ = tx.unbounded_send(chunk("{\"type\":\"token\",\"data\":\"jeûne\"}\n"));
        let _ = tx.unbounded_send(chunk("{\"type\":\"done\"}\n"));
        assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Cancelled);

        let messages = engine.current_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Le ");
        assert!(!messages[1].is_streaming);
        assert_eq!(engine.quota().used_today, 0);
        assert!(drain(&mut notices)
            .iter()
            .any(|n| matches!(n, EngineNotice::StreamFinished { .. })));
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let (engine, _transport) = engine();
        assert!(!engine.stop());
        assert!(engine.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_stop_is_accepted() {
        let (engine, transport, mut notices) = engine_with_notices();
        let _tx = transport.live();

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.send("q1", SourceFilter::Both).await }
        });
        notices.recv().await.unwrap();
        engine.stop();
        assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Cancelled);

        transport.body("{\"type\":\"token\",\"data\":\"a2\"}\n{\"type\":\"done\"}\n");
        let outcome = engine.send("q2", SourceFilter::Both).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(engine.current_messages().len(), 4);
        assert_eq!(engine.current_messages()[3].content, "a2");
    }

    #[tokio::test]
    async fn test_deleting_streaming_conversation_stops_request() {
        let (engine, transport, mut notices) = engine_with_notices();
        let _tx = transport.live();

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.send("q", SourceFilter::Both).await }
        });
        notices.recv().await.unwrap();

        let id = engine.active_id();
        engine.delete_conversation(&id).unwrap();
        assert!(!engine.is_streaming());
        assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Cancelled);
        assert_eq!(engine.conversations().len(), 1);
        assert!(engine.current_messages().is_empty());
    }

    // ---- Error classification ----

    #[tokio::test]
    async fn test_forbidden_retracts_turn_with_reset_time() {
        let (engine, transport, mut notices) = engine_with_notices();
        transport.push(Reply::Fail(TransportError::Forbidden {
            message: "limit".to_string(),
            reset_time: Some("3h 12m".to_string()),
        }));

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        match err {
            ChatError::LimitReached { reset_time } => {
                assert_eq!(reset_time.as_deref(), Some("3h 12m"))
            }
            other => panic!("expected LimitReached, got {:?}", other),
        }
        assert!(engine.current_messages().is_empty());
        assert_eq!(engine.current_conversation().title, DEFAULT_TITLE);
        assert!(engine.is_limit_reached());
        assert_eq!(engine.quota().reset_time.as_deref(), Some("3h 12m"));
        assert!(drain(&mut notices).contains(&EngineNotice::LimitReached {
            reset_time: "3h 12m".to_string()
        }));

        // Later sends are refused locally.
        let err = engine.send("again", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::LimitReached { .. }));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_in_stream_limit_error_retracts_turn() {
        let (engine, transport) = engine();
        transport.body(
            "{\"type\":\"error\",\"data\":\"quota\",\"error_code\":\"limit_reached\",\"reset_time\":\"1h 0m\"}\n",
        );

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        match err {
            ChatError::LimitReached { reset_time } => {
                assert_eq!(reset_time.as_deref(), Some("1h 0m"))
            }
            other => panic!("expected LimitReached, got {:?}", other),
        }
        assert!(engine.current_messages().is_empty());
        assert!(engine.is_limit_reached());
    }

    #[tokio::test]
    async fn test_unauthorized_adds_no_messages() {
        let (engine, transport, mut notices) = engine_with_notices();
        transport.push(Reply::Fail(TransportError::Unauthorized));

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthenticated));
        assert!(engine.current_messages().is_empty());
        assert!(drain(&mut notices).contains(&EngineNotice::AuthRequired));
        assert!(!engine.is_streaming());
    }

    #[tokio::test]
    async fn test_generation_error_replaces_answer() {
        let (engine, transport) = engine();
        transport.body("{\"type\":\"token\",\"data\":\"Le \"}\n{\"type\":\"error\",\"data\":\"boom\"}\n");

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::Generation(ref m) if m == "boom"));
        let messages = engine.current_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "q");
        assert_eq!(messages[1].content, "Erreur: boom");
        assert!(!messages[1].is_streaming);
        assert_eq!(engine.quota().used_today, 0);
    }

    #[tokio::test]
    async fn test_unknown_error_code_is_generation_error() {
        let (engine, transport) = engine();
        transport.body("{\"type\":\"error\",\"data\":\"x\",\"error_code\":\"model_down\"}\n");

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::Generation(_)));
        assert_eq!(engine.current_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_incomplete_stream_finalizes_with_error() {
        let (engine, transport) = engine();
        transport.body("{\"type\":\"token\",\"data\":\"Le \"}\n{\"type\":\"tok");

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::IncompleteStream));
        let messages = engine.current_messages();
        assert_eq!(messages[1].content, NETWORK_ERROR_TEXT);
        assert!(!messages[1].is_streaming);
        assert!(!engine.is_streaming());
    }

    #[tokio::test]
    async fn test_network_error_before_stream() {
        let (engine, transport) = engine();
        transport.push(Reply::Fail(TransportError::Network(
            "connection refused".to_string(),
        )));

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
        let messages = engine.current_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "q");
        assert_eq!(messages[1].content, NETWORK_ERROR_TEXT);
        assert!(!messages[1].is_streaming);
    }

    #[tokio::test]
    async fn test_body_error_mid_stream() {
        let (engine, transport) = engine();
        transport.push(Reply::Chunks(vec![
            chunk("{\"type\":\"token\",\"data\":\"Le \"}\n"),
            Err(TransportError::Body("reset by peer".to_string())),
        ]));

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
        assert_eq!(engine.current_messages()[1].content, NETWORK_ERROR_TEXT);
    }

    #[tokio::test]
    async fn test_server_status_error_is_network_error() {
        let (engine, transport) = engine();
        transport.push(Reply::Fail(TransportError::Status(500)));

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
    }

    // ---- Validation and quota ----

    #[tokio::test]
    async fn test_blank_question_rejected() {
        let (engine, transport) = engine();
        let err = engine.send("   \n", SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_long_question_rejected() {
        let (engine, _transport) = engine();
        let question = "é".repeat(2001);
        let err = engine.send(&question, SourceFilter::Both).await.unwrap_err();
        assert!(matches!(err, ChatError::MessageTooLong(2000)));
        assert!(engine.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_quota_refuses_before_network() {
        let (engine, transport, mut notices) = engine_with_notices();
        let engine = engine.with_quota(QuotaTracker::new(3, 3));

        let err = engine.send("q", SourceFilter::Both).await.unwrap_err();
        match err {
            ChatError::LimitReached { reset_time } => assert!(reset_time.is_some()),
            other => panic!("expected LimitReached, got {:?}", other),
        }
        assert_eq!(transport.request_count(), 0);
        assert!(engine.current_messages().is_empty());
        let notices = drain(&mut notices);
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], EngineNotice::LimitReached { .. }));
    }

    #[tokio::test]
    async fn test_unlimited_quota_never_refuses() {
        let (engine, transport) = engine();
        let engine = engine.with_quota(QuotaTracker::unlimited());
        for _ in 0..7 {
            transport.body("{\"type\":\"done\"}\n");
        }
        for i in 0..7 {
            let outcome = engine.send(&format!("q{}", i), SourceFilter::Both).await.unwrap();
            assert_eq!(outcome, SendOutcome::Completed);
        }
        assert!(!engine.is_limit_reached());
    }

    #[tokio::test]
    async fn test_reconcile_quota_from_profile() {
        let (engine, _transport) = engine();
        let engine = engine.with_quota(QuotaTracker::new(5, 5));
        assert!(engine.is_limit_reached());

        let profile = UserProfile {
            subscription_plan: Some(SubscriptionPlan {
                name: "Premium".to_string(),
                daily_request_limit: -1,
            }),
            requests_today: 12,
            last_request_date: Some(Local::now().date_naive()),
        };
        engine.reconcile_quota(&profile);
        assert!(!engine.is_limit_reached());
        assert_eq!(engine.quota().limit, -1);
    }

    // ---- Conversations and session ----

    #[tokio::test]
    async fn test_new_chat_reuses_empty_conversation() {
        let (engine, _transport) = engine();
        let before = engine.conversations().len();
        engine.new_chat();
        assert_eq!(engine.conversations().len(), before);
    }

    #[tokio::test]
    async fn test_new_chat_after_answer_creates_conversation() {
        let (engine, transport) = engine();
        transport.body(SCENARIO);
        engine.send("q", SourceFilter::Both).await.unwrap();

        let id = engine.new_chat();
        assert_eq!(engine.conversations().len(), 2);
        assert_eq!(engine.active_id(), id);
        assert!(engine.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_delete_only_conversation_leaves_empty_one() {
        let (engine, transport) = engine();
        transport.body(SCENARIO);
        engine.send("q", SourceFilter::Both).await.unwrap();

        let id = engine.active_id();
        engine.delete_conversation(&id).unwrap();
        let conversations = engine.conversations();
        assert_eq!(conversations.len(), 1);
        assert!(conversations[0].is_empty());
    }

    #[tokio::test]
    async fn test_entry_points_save_active_id() {
        let transport = Arc::new(ScriptedTransport::default());
        let session = Arc::new(MemorySessionStore::new());
        let engine =
            ChatEngine::new(transport.clone(), ChatConfig::default()).with_session(session.clone());
        transport.body(SCENARIO);
        engine.send("q", SourceFilter::Both).await.unwrap();
        let first = engine.active_id();

        let second = engine.new_chat();
        assert_eq!(session.load_active_id().as_deref(), Some(second.as_str()));

        engine.select_conversation(&first).unwrap();
        assert_eq!(session.load_active_id().as_deref(), Some(first.as_str()));

        engine.delete_conversation(&first).unwrap();
        assert_eq!(session.load_active_id(), Some(engine.active_id()));
    }

    /// Session store whose writes always fail.
    struct ReadOnlySession;

    impl SessionStore for ReadOnlySession {
        fn load_active_id(&self) -> Option<String> {
            None
        }

        fn save_active_id(&self, _id: &str) -> noor_core::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }
    }

    #[tokio::test]
    async fn test_entry_points_survive_session_write_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        let engine = ChatEngine::new(transport.clone(), ChatConfig::default())
            .with_session(Arc::new(ReadOnlySession));
        transport.body(SCENARIO);
        engine.send("q", SourceFilter::Both).await.unwrap();
        let first = engine.active_id();

        let second = engine.new_chat();
        assert_ne!(second, first);
        assert_eq!(engine.active_id(), second);

        engine.select_conversation(&first).unwrap();
        assert_eq!(engine.active_id(), first);

        engine.delete_conversation(&first).unwrap();
        assert!(engine.conversations().iter().all(|c| c.id != first));
    }

    #[tokio::test]
    async fn test_select_unknown_conversation() {
        let (engine, _transport) = engine();
        let err = engine.select_conversation("missing").unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_goes_to_selected_conversation() {
        let (engine, transport) = engine();
        transport.body(SCENARIO);
        transport.body("{\"type\":\"done\"}\n");
        engine.send("q1", SourceFilter::Both).await.unwrap();
        let first = engine.active_id();
        engine.new_chat();
        engine.select_conversation(&first).unwrap();

        engine.send("q2", SourceFilter::Both).await.unwrap();
        assert_eq!(engine.current_messages().len(), 4);
    }

    // ---- History ----

    fn history_turn(id: &str, query: &str) -> HistoryTurn {
        HistoryTurn {
            id: id.to_string(),
            query: query.to_string(),
            response: "réponse".to_string(),
            sources: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_history_restores_remembered_conversation() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.set_history(Ok(vec![history_turn("2", "b"), history_turn("1", "a")]));
        let session = Arc::new(MemorySessionStore::with_active_id("1"));
        let engine =
            ChatEngine::new(transport.clone(), ChatConfig::default()).with_session(session.clone());

        let count = engine.load_history().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(engine.conversations().len(), 3);
        assert_eq!(engine.active_id(), "1");
        assert_eq!(engine.current_messages()[0].content, "a");
        assert_eq!(session.load_active_id().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_load_history_unauthorized_notifies() {
        let (engine, transport, mut notices) = engine_with_notices();
        transport.set_history(Err(TransportError::Unauthorized));

        let err = engine.load_history().await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthenticated));
        assert_eq!(drain(&mut notices), vec![EngineNotice::AuthRequired]);
        assert_eq!(engine.conversations().len(), 1);
    }

    // ---- Notices ----

    #[tokio::test]
    async fn test_notices_bracket_each_request() {
        let (engine, transport, mut notices) = engine_with_notices();
        transport.body(SCENARIO);
        engine.send("q", SourceFilter::Both).await.unwrap();

        let id = engine.active_id();
        assert_eq!(
            drain(&mut notices),
            vec![
                EngineNotice::StreamStarted {
                    conversation_id: id.clone()
                },
                EngineNotice::StreamFinished {
                    conversation_id: id
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_notice_receiver_is_harmless() {
        let (engine, transport, notices) = engine_with_notices();
        drop(notices);
        transport.body(SCENARIO);
        let outcome = engine.send("q", SourceFilter::Both).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);
    }
}
