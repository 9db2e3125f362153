//! Authoritative client-side model of sessions, messages, attention items
//! and resolved interactions.
//!
//! Everything here is synchronous and keyed by identifier, so inputs can be
//! applied in any arrival order. The engine owns one `SessionState` and
//! publishes clones of it to observers.

use chrono::{DateTime, Utc};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use std::collections::{HashMap, HashSet};

use crate::content::{extract_text_content, workdir_name};
use crate::creation::PendingCreation;
use crate::events::ServerEvent;
use crate::types::{
    AttentionItem, CreateSessionResponse, Message, MessageRole, PermissionMode,
    ResolvedInteraction, Session, SessionFilter, SessionWithAttention, WorkdirGroup,
};

/// Confirmed creations are remembered so a late `session:created` for an
/// already-claimed session is not claimed a second time.
const MAX_RESOLVED_CREATIONS: usize = 32;

pub const LOGIN_ERROR: &str = "Connection failed - check token";

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    sessions: Vec<Session>,
    messages: HashMap<String, Vec<Message>>,
    /// Sessions whose full history has been fetched. Pushed or optimistic
    /// messages alone do not count.
    history_loaded: HashSet<String>,
    attention: Vec<AttentionItem>,
    interactions: HashMap<String, Vec<ResolvedInteraction>>,
    pending: Vec<PendingCreation>,
    pub(crate) active_session_id: Option<String>,
    pub(crate) awaiting_response: bool,
    pub(crate) connected: bool,
    pub(crate) login_error: Option<String>,
    pub(crate) is_refreshing: bool,
}

/// One row of a session transcript.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TranscriptItem<'a> {
    Message(&'a Message),
    Interaction(&'a ResolvedInteraction),
}

impl TranscriptItem<'_> {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            TranscriptItem::Message(m) => m.timestamp,
            TranscriptItem::Interaction(i) => Some(i.resolved_at),
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- read-only views ----

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn attention(&self) -> &[AttentionItem] {
        &self.attention
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.session(self.active_session_id.as_deref()?)
    }

    pub fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn login_error(&self) -> Option<&str> {
        self.login_error.as_deref()
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing
    }

    pub fn pending_creations(&self) -> &[PendingCreation] {
        &self.pending
    }

    pub fn has_history(&self, session_id: &str) -> bool {
        self.history_loaded.contains(session_id)
    }

    pub fn session_messages(&self, session_id: &str) -> &[Message] {
        self.messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn active_messages(&self) -> &[Message] {
        match &self.active_session_id {
            Some(id) => self.session_messages(id),
            None => &[],
        }
    }

    pub fn session_attention(&self, session_id: &str) -> Vec<&AttentionItem> {
        self.attention
            .iter()
            .filter(|a| a.session_id == session_id)
            .collect()
    }

    pub fn active_attention(&self) -> Vec<&AttentionItem> {
        match &self.active_session_id {
            Some(id) => self.session_attention(id),
            None => Vec::new(),
        }
    }

    pub fn session_interactions(&self, session_id: &str) -> &[ResolvedInteraction] {
        self.interactions
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// True for a placeholder whose creation is still unresolved.
    pub fn is_pending_placeholder(&self, id: &str) -> bool {
        self.pending.iter().any(|p| p.temp_id == id && p.is_pending())
    }

    /// Messages and resolved interactions merged by time. Items without a
    /// timestamp sort first; ties keep their original order.
    pub fn transcript(&self, session_id: &str) -> Vec<TranscriptItem<'_>> {
        let mut items: Vec<TranscriptItem<'_>> = self
            .session_messages(session_id)
            .iter()
            .map(TranscriptItem::Message)
            .chain(
                self.session_interactions(session_id)
                    .iter()
                    .map(TranscriptItem::Interaction),
            )
            .collect();
        items.sort_by_key(|item| item.timestamp());
        items
    }

    /// Sessions grouped by workdir, most recently modified first at both levels.
    pub fn workdir_groups(&self) -> Vec<WorkdirGroup> {
        let mut by_session: HashMap<&str, Vec<AttentionItem>> = HashMap::new();
        for item in &self.attention {
            by_session
                .entry(item.session_id.as_str())
                .or_default()
                .push(item.clone());
        }

        let mut groups: Vec<WorkdirGroup> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for session in &self.sessions {
            let workdir = if session.workdir.is_empty() {
                "Unknown"
            } else {
                session.workdir.as_str()
            };
            let entry = SessionWithAttention {
                session: session.clone(),
                attention: by_session.get(session.id.as_str()).cloned().unwrap_or_default(),
            };
            match index.get(workdir) {
                Some(&i) => groups[i].sessions.push(entry),
                None => {
                    index.insert(workdir, groups.len());
                    groups.push(WorkdirGroup {
                        name: workdir_name(workdir).to_string(),
                        workdir: workdir.to_string(),
                        sessions: vec![entry],
                    });
                }
            }
        }

        for group in &mut groups {
            group
                .sessions
                .sort_by(|a, b| b.session.modified.cmp(&a.session.modified));
        }
        groups.sort_by(|a, b| latest_modified(b).cmp(&latest_modified(a)));
        groups
    }

    /// Groups after search, then the attention filter.
    pub fn visible_groups(&self, query: &str, filter: SessionFilter) -> Vec<WorkdirGroup> {
        filter_groups(search_groups(self.workdir_groups(), query), filter)
    }

    // ---- bulk loads ----

    /// Replace the session and attention sets with freshly fetched ones.
    /// Placeholders that are still pending are kept at the front.
    pub fn load_snapshot(&mut self, sessions: Vec<Session>, attention: Vec<AttentionItem>) {
        self.replace_sessions(sessions);
        self.attention = attention;
    }

    /// Store fetched history. Dropped if the session is gone by now.
    pub fn set_history(&mut self, session_id: &str, messages: Vec<Message>) {
        if self.session(session_id).is_none() {
            return;
        }
        self.messages.insert(session_id.to_string(), messages);
        self.history_loaded.insert(session_id.to_string());
    }

    fn replace_sessions(&mut self, fetched: Vec<Session>) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut next: Vec<Session> = Vec::with_capacity(fetched.len());
        for s in &self.sessions {
            if self.is_pending_placeholder(&s.id) && seen.insert(s.id.clone()) {
                next.push(s.clone());
            }
        }
        for s in fetched {
            if seen.insert(s.id.clone()) {
                next.push(s);
            }
        }
        self.sessions = next;
    }

    // ---- push events ----

    pub fn apply_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session, temp_id } => {
                self.on_session_created(session, temp_id.as_deref());
            }
            ServerEvent::SessionUpdated { session } => {
                if let Some(existing) = self.sessions.iter_mut().find(|s| s.id == session.id) {
                    *existing = session;
                }
            }
            ServerEvent::SessionEnded { session_id, .. } => {
                self.sessions.retain(|s| s.id != session_id);
                self.attention.retain(|a| a.session_id != session_id);
                if self.active_session_id.as_deref() == Some(session_id.as_str()) {
                    self.awaiting_response = false;
                }
            }
            ServerEvent::SessionMessage {
                session_id,
                message,
            } => self.on_message(&session_id, message),
            ServerEvent::AttentionRequested { attention } => {
                self.attention.retain(|a| a.id != attention.id);
                self.attention.push(attention);
            }
            ServerEvent::AttentionResolved { attention_id } => {
                self.attention.retain(|a| a.id != attention_id);
            }
            ServerEvent::InteractionResolved {
                session_id,
                interaction,
            } => {
                self.interactions
                    .entry(session_id)
                    .or_default()
                    .push(interaction);
            }
            ServerEvent::Unknown => {}
        }
    }

    fn on_session_created(&mut self, session: Session, temp_id: Option<&str>) {
        let already_claimed = self
            .pending
            .iter()
            .any(|p| p.confirmed_id() == Some(session.id.as_str()));

        let claim = if already_claimed || session.is_placeholder() {
            None
        } else {
            temp_id
                .and_then(|t| {
                    self.pending
                        .iter()
                        .position(|p| p.is_pending() && p.backend_temp_id.as_deref() == Some(t))
                })
                .or_else(|| {
                    // Oldest unresolved placeholder for this workdir that is
                    // not known to belong to a different creation.
                    self.pending.iter().position(|p| {
                        p.is_pending()
                            && p.workdir == session.workdir
                            && (p.backend_temp_id.is_none() || temp_id.is_none())
                    })
                })
        };

        match claim {
            Some(idx) => {
                let temp_id = self.pending[idx].temp_id.clone();
                let real_id = session.id.clone();
                self.pending[idx].confirm(real_id.clone());
                self.swap_placeholder(&temp_id, session);
                self.redirect_active(&temp_id, Some(real_id));
                self.prune_pending();
            }
            None => self.upsert_session(session),
        }
    }

    fn on_message(&mut self, session_id: &str, message: Message) {
        let existing = self.messages.entry(session_id.to_string()).or_default();
        let optimistic_idx = if message.role == MessageRole::User {
            let text = extract_text_content(&message.content);
            existing.iter().position(|m| {
                m.optimistic
                    && m.role == MessageRole::User
                    && extract_text_content(&m.content) == text
            })
        } else {
            None
        };
        match optimistic_idx {
            Some(idx) => existing[idx] = message,
            None => existing.push(message),
        }
        if self.active_session_id.as_deref() == Some(session_id) {
            self.awaiting_response = false;
        }
    }

    /// Replace by id in place, or append.
    fn upsert_session(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }

    /// Put `session` where the placeholder was, dropping any other copy of it.
    fn swap_placeholder(&mut self, temp_id: &str, session: Session) {
        let placeholder = self.sessions.iter().position(|s| s.id == temp_id);
        let real = self.sessions.iter().position(|s| s.id == session.id);
        match (placeholder, real) {
            (Some(p), None) => self.sessions[p] = session,
            (Some(p), Some(r)) => {
                self.sessions[r] = session;
                self.sessions.remove(p);
            }
            (None, _) => self.upsert_session(session),
        }
        self.messages.remove(temp_id);
        self.history_loaded.remove(temp_id);
    }

    fn redirect_active(&mut self, from: &str, to: Option<String>) {
        if self.active_session_id.as_deref() == Some(from) {
            self.active_session_id = to;
        }
    }

    fn prune_pending(&mut self) {
        self.pending.retain(|p| p.is_pending() || p.confirmed_id().is_some());
        let resolved = self.pending.iter().filter(|p| !p.is_pending()).count();
        let mut excess = resolved.saturating_sub(MAX_RESOLVED_CREATIONS);
        self.pending.retain(|p| {
            if excess > 0 && !p.is_pending() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    // ---- session creation ----

    /// Insert a placeholder at the front and point the active session at it.
    pub fn begin_creation(&mut self, placeholder: Session, pending: PendingCreation) {
        self.active_session_id = Some(placeholder.id.clone());
        self.sessions.retain(|s| s.id != placeholder.id);
        self.sessions.insert(0, placeholder);
        self.pending.push(pending);
    }

    /// The create call succeeded; remember what the backend said about it.
    pub fn record_creation_ack(&mut self, temp_id: &str, response: &CreateSessionResponse) {
        if let Some(p) = self.pending.iter_mut().find(|p| p.temp_id == temp_id) {
            p.backend_temp_id = Some(response.temp_id.clone());
            p.backend_name = response.name.clone();
        }
    }

    /// The create call failed: drop the placeholder.
    pub fn fail_creation(&mut self, temp_id: &str) {
        let Some(p) = self.pending.iter_mut().find(|p| p.temp_id == temp_id) else {
            return;
        };
        if !p.fail() {
            return;
        }
        self.sessions.retain(|s| s.id != temp_id);
        self.redirect_active(temp_id, None);
        self.prune_pending();
    }

    /// Apply the delayed post-creation refresh.
    ///
    /// If the creation is still unresolved, claim the most recently created
    /// real session in its workdir that no other creation has claimed,
    /// preferring one whose name matches what the backend reported. With no
    /// candidate the placeholder is dropped. The session list is then
    /// replaced with `fetched`.
    pub fn resolve_creation(&mut self, temp_id: &str, fetched: Vec<Session>) {
        let idx = self
            .pending
            .iter()
            .position(|p| p.temp_id == temp_id && p.is_pending());

        if let Some(idx) = idx {
            let chosen = {
                let claimed: HashSet<&str> =
                    self.pending.iter().filter_map(|p| p.confirmed_id()).collect();
                let pending = &self.pending[idx];
                let candidates: Vec<&Session> = fetched
                    .iter()
                    .filter(|s| {
                        s.workdir == pending.workdir
                            && !s.is_placeholder()
                            && !claimed.contains(s.id.as_str())
                    })
                    .collect();
                let by_name = pending.backend_name.as_ref().and_then(|name| {
                    candidates
                        .iter()
                        .filter(|s| s.name.as_ref() == Some(name))
                        .max_by_key(|s| s.created)
                });
                by_name
                    .or_else(|| candidates.iter().max_by_key(|s| s.created))
                    .map(|s| s.id.clone())
            };

            match chosen {
                Some(real_id) => {
                    self.pending[idx].confirm(real_id.clone());
                    self.redirect_active(temp_id, Some(real_id));
                }
                None => {
                    self.pending[idx].fail();
                    self.redirect_active(temp_id, None);
                }
            }
        }

        self.replace_sessions(fetched);
        self.prune_pending();
    }

    // ---- local mutations ----

    pub fn push_optimistic(&mut self, session_id: &str, text: &str) {
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(Message::optimistic_user(text));
        self.awaiting_response = true;
    }

    /// Undo `push_optimistic` after the send call failed.
    pub fn drop_optimistic(&mut self, session_id: &str, text: &str) {
        if let Some(messages) = self.messages.get_mut(session_id) {
            if let Some(idx) = messages.iter().rposition(|m| {
                m.optimistic && m.role == MessageRole::User && extract_text_content(&m.content) == text
            }) {
                messages.remove(idx);
            }
        }
        if self.active_session_id.as_deref() == Some(session_id) {
            self.awaiting_response = false;
        }
    }

    /// Navigable address mirroring the active session, e.g. `#session=abc`.
    pub fn address(&self) -> String {
        format_address(self.active_session_id.as_deref())
    }

    pub fn remove_session(&mut self, session_id: &str) {
        self.sessions.retain(|s| s.id != session_id);
        self.messages.remove(session_id);
        self.history_loaded.remove(session_id);
        if self.active_session_id.as_deref() == Some(session_id) {
            self.active_session_id = None;
        }
    }

    pub fn rename_local(&mut self, session_id: &str, name: &str) {
        if let Some(s) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            s.name = Some(name.to_string());
        }
    }

    pub fn set_permission_mode_local(&mut self, session_id: &str, mode: PermissionMode) {
        if let Some(s) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            s.permission_mode = mode;
            s.config.permission_mode = Some(mode);
        }
    }
}

const ADDRESS_PREFIX: &str = "#session=";

/// Session id carried by a navigable address, if any.
pub fn parse_address(address: &str) -> Option<String> {
    address
        .strip_prefix(ADDRESS_PREFIX)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub fn format_address(session_id: Option<&str>) -> String {
    match session_id {
        Some(id) => format!("{}{}", ADDRESS_PREFIX, id),
        None => String::new(),
    }
}

fn latest_modified(group: &WorkdirGroup) -> Option<DateTime<Utc>> {
    group.sessions.first().map(|s| s.session.modified)
}

/// Restrict groups to the given filter, dropping groups left empty.
pub fn filter_groups(groups: Vec<WorkdirGroup>, filter: SessionFilter) -> Vec<WorkdirGroup> {
    match filter {
        SessionFilter::All => groups,
        SessionFilter::Attention => groups
            .into_iter()
            .filter_map(|mut g| {
                g.sessions.retain(|s| !s.attention.is_empty());
                (!g.sessions.is_empty()).then_some(g)
            })
            .collect(),
    }
}

/// Fuzzy search over groups. A group whose name or workdir matches keeps all
/// of its sessions; otherwise only matching sessions stay, and groups left
/// empty are dropped. A blank query matches everything.
pub fn search_groups(groups: Vec<WorkdirGroup>, query: &str) -> Vec<WorkdirGroup> {
    let query = query.trim();
    if query.is_empty() {
        return groups;
    }
    let matcher = SkimMatcherV2::default().ignore_case();
    let hit = |text: &str| matcher.fuzzy_match(text, query).is_some();

    groups
        .into_iter()
        .filter_map(|mut g| {
            if hit(&g.name) || hit(&g.workdir) {
                return Some(g);
            }
            g.sessions.retain(|s| {
                let session = &s.session;
                hit(&session.display_name())
                    || session.name.as_deref().is_some_and(|name| hit(name))
                    || hit(workdir_name(&session.workdir))
                    || hit(&session.workdir)
            });
            (!g.sessions.is_empty()).then_some(g)
        })
        .collect()
}
