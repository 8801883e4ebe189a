//! Live connections: role, outbound queue and the attached session's trimmed history.
//!
//! Every method takes the lock once, so no caller can observe a half-applied change
//! (e.g. a portal removed from the set while still counted as present).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

use super::protocol::{ClientRole, ServerEvent};
use crate::llm::{HistoryRole, HistoryTurn};
use crate::session::SessionId;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Connection {
    tx: EventSender,
    role: Option<ClientRole>,
    session: Option<AttachedSession>,
}

struct AttachedSession {
    db_id: SessionId,
    history: VecDeque<HistoryTurn>,
}

/// What the relay needs to serve one `send_message`.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub db_id: SessionId,
    pub history: Vec<HistoryTurn>,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub role: Option<ClientRole>,
    /// True when this was a portal and no other portal remains.
    pub last_portal: bool,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. `requested` is reused when no live connection holds it; otherwise a
    /// fresh id is generated. Returns the id in use.
    pub fn register(&self, requested: Option<&str>, tx: EventSender) -> String {
        let mut g = self.inner.lock();
        let id = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(r) if !g.contains_key(r) => r.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        g.insert(
            id.clone(),
            Connection {
                tx,
                role: None,
                session: None,
            },
        );
        id
    }

    /// Record the role if none is set yet. Returns false for unknown or already identified
    /// connections.
    pub fn claim_role(&self, socket_id: &str, role: ClientRole) -> bool {
        let mut g = self.inner.lock();
        match g.get_mut(socket_id) {
            Some(conn) if conn.role.is_none() => {
                conn.role = Some(role);
                true
            }
            _ => false,
        }
    }

    /// Forget the role of a connection that failed to finish identifying, so it may identify
    /// again.
    pub fn release_role(&self, socket_id: &str) {
        if let Some(conn) = self.inner.lock().get_mut(socket_id) {
            conn.role = None;
            conn.session = None;
        }
    }

    pub fn role(&self, socket_id: &str) -> Option<ClientRole> {
        self.inner.lock().get(socket_id).and_then(|c| c.role)
    }

    pub fn contains(&self, socket_id: &str) -> bool {
        self.inner.lock().contains_key(socket_id)
    }

    /// Bind a chatbot connection to its persisted session. `history` is trimmed to `window`.
    pub fn attach_session(
        &self,
        socket_id: &str,
        db_id: SessionId,
        history: Vec<HistoryTurn>,
        window: usize,
    ) -> bool {
        let mut g = self.inner.lock();
        let Some(conn) = g.get_mut(socket_id) else {
            return false;
        };
        let mut history: VecDeque<HistoryTurn> = history.into();
        trim(&mut history, window);
        conn.session = Some(AttachedSession { db_id, history });
        true
    }

    pub fn session(&self, socket_id: &str) -> Option<SessionSnapshot> {
        self.inner.lock().get(socket_id).and_then(|c| {
            c.session.as_ref().map(|s| SessionSnapshot {
                db_id: s.db_id.clone(),
                history: s.history.iter().cloned().collect(),
            })
        })
    }

    /// Append a user/bot pair to the in-memory history, dropping the oldest beyond `window`.
    pub fn push_turns(&self, socket_id: &str, user: HistoryTurn, bot: HistoryTurn, window: usize) {
        let mut g = self.inner.lock();
        if let Some(session) = g.get_mut(socket_id).and_then(|c| c.session.as_mut()) {
            session.history.push_back(user);
            session.history.push_back(bot);
            trim(&mut session.history, window);
        }
    }

    pub fn clear_history(&self, socket_id: &str) {
        let mut g = self.inner.lock();
        if let Some(session) = g.get_mut(socket_id).and_then(|c| c.session.as_mut()) {
            session.history.clear();
        }
    }

    /// Chatbot socket currently attached to `db_id`, if any.
    pub fn socket_for_session(&self, db_id: &str) -> Option<String> {
        self.inner
            .lock()
            .iter()
            .find(|(_, c)| c.session.as_ref().is_some_and(|s| s.db_id == db_id))
            .map(|(id, _)| id.clone())
    }

    /// Clear the in-memory history of whichever socket is attached to `db_id` and return it.
    pub fn clear_history_for_session(&self, db_id: &str) -> Option<String> {
        let mut g = self.inner.lock();
        let (id, conn) = g
            .iter_mut()
            .find(|(_, c)| c.session.as_ref().is_some_and(|s| s.db_id == db_id))?;
        if let Some(session) = conn.session.as_mut() {
            session.history.clear();
        }
        Some(id.clone())
    }

    /// Unbind whichever socket is attached to `db_id` and return it.
    pub fn detach_session(&self, db_id: &str) -> Option<String> {
        let mut g = self.inner.lock();
        let (id, conn) = g
            .iter_mut()
            .find(|(_, c)| c.session.as_ref().is_some_and(|s| s.db_id == db_id))?;
        conn.session = None;
        Some(id.clone())
    }

    /// Unbind every attached socket; returns their ids.
    pub fn detach_all(&self) -> Vec<String> {
        let mut g = self.inner.lock();
        g.iter_mut()
            .filter_map(|(id, c)| c.session.take().map(|_| id.clone()))
            .collect()
    }

    /// Queue an event for one socket. False when the socket is gone.
    pub fn send_to(&self, socket_id: &str, event: ServerEvent) -> bool {
        let g = self.inner.lock();
        match g.get(socket_id) {
            Some(conn) => conn.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue an event for every connection with `role`; returns how many were queued.
    pub fn broadcast_role(&self, role: ClientRole, event: &ServerEvent) -> usize {
        let g = self.inner.lock();
        g.values()
            .filter(|c| c.role == Some(role))
            .filter(|c| c.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Queue an event for every connection, identified or not.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let g = self.inner.lock();
        g.values()
            .filter(|c| c.tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn portal_count(&self) -> usize {
        self.count(ClientRole::Portal)
    }

    pub fn count(&self, role: ClientRole) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|c| c.role == Some(role))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a connection (and its in-memory history).
    pub fn remove(&self, socket_id: &str) -> Option<Departed> {
        let mut g = self.inner.lock();
        let conn = g.remove(socket_id)?;
        let last_portal = conn.role == Some(ClientRole::Portal)
            && !g.values().any(|c| c.role == Some(ClientRole::Portal));
        Some(Departed {
            role: conn.role,
            last_portal,
        })
    }
}

/// Keep at most `window` turns, starting on a user turn.
fn trim(history: &mut VecDeque<HistoryTurn>, window: usize) {
    while history.len() > window {
        history.pop_front();
    }
    while history.front().is_some_and(|t| t.role == HistoryRole::Model) {
        history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(reg: &ConnectionRegistry) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (reg.register(None, tx), rx)
    }

    #[test]
    fn role_is_claimed_once() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = conn(&reg);
        assert!(reg.claim_role(&id, ClientRole::Portal));
        assert!(!reg.claim_role(&id, ClientRole::Chatbot));
        assert_eq!(reg.role(&id), Some(ClientRole::Portal));
        assert!(!reg.claim_role("missing", ClientRole::Chatbot));
    }

    #[test]
    fn requested_id_is_reused_only_when_free() {
        let reg = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(reg.register(Some("abc"), tx.clone()), "abc");
        let second = reg.register(Some("abc"), tx);
        assert_ne!(second, "abc");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn history_window_drops_oldest() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = conn(&reg);
        reg.attach_session(&id, "db".into(), vec![], 4);
        for i in 0..3 {
            reg.push_turns(
                &id,
                HistoryTurn::user(format!("q{}", i)),
                HistoryTurn::model(format!("a{}", i)),
                4,
            );
        }
        let snap = reg.session(&id).unwrap();
        assert_eq!(snap.history.len(), 4);
        assert_eq!(snap.history[0].text, "q1");
        reg.clear_history(&id);
        assert!(reg.session(&id).unwrap().history.is_empty());
    }

    #[test]
    fn last_portal_departure_is_reported() {
        let reg = ConnectionRegistry::new();
        let (p1, _r1) = conn(&reg);
        let (p2, _r2) = conn(&reg);
        let (c, _r3) = conn(&reg);
        reg.claim_role(&p1, ClientRole::Portal);
        reg.claim_role(&p2, ClientRole::Portal);
        reg.claim_role(&c, ClientRole::Chatbot);
        assert!(!reg.remove(&p1).unwrap().last_portal);
        assert!(reg.remove(&p2).unwrap().last_portal);
        let gone = reg.remove(&c).unwrap();
        assert_eq!(gone.role, Some(ClientRole::Chatbot));
        assert!(!gone.last_portal);
        assert!(reg.remove(&c).is_none());
    }

    #[test]
    fn broadcast_reaches_only_the_role() {
        let reg = ConnectionRegistry::new();
        let (p, mut rp) = conn(&reg);
        let (c, mut rc) = conn(&reg);
        reg.claim_role(&p, ClientRole::Portal);
        reg.claim_role(&c, ClientRole::Chatbot);
        let n = reg.broadcast_role(ClientRole::Portal, &ServerEvent::HistoryCleared {});
        assert_eq!(n, 1);
        assert!(rp.try_recv().is_ok());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn finds_socket_by_session() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = conn(&reg);
        reg.attach_session(&id, "db-1".into(), vec![HistoryTurn::user("x")], 10);
        assert_eq!(reg.socket_for_session("db-1").as_deref(), Some(id.as_str()));
        assert_eq!(reg.clear_history_for_session("db-1").as_deref(), Some(id.as_str()));
        assert!(reg.session(&id).unwrap().history.is_empty());
        assert!(reg.socket_for_session("db-2").is_none());
    }

    #[test]
    fn restored_history_never_starts_with_a_model_turn() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = conn(&reg);
        // q0/a0, an unanswered question, then four answered ones: eleven turns.
        let mut turns = vec![HistoryTurn::user("q0"), HistoryTurn::model("a0"), HistoryTurn::user("lost")];
        for i in 1..5 {
            turns.push(HistoryTurn::user(format!("q{}", i)));
            turns.push(HistoryTurn::model(format!("a{}", i)));
        }
        reg.attach_session(&id, "db".into(), turns, 10);
        let snap = reg.session(&id).unwrap();
        assert_eq!(snap.history.len(), 9);
        assert_eq!(snap.history[0], HistoryTurn::user("lost"));

        reg.push_turns(&id, HistoryTurn::user("q5"), HistoryTurn::model("a5"), 10);
        let snap = reg.session(&id).unwrap();
        assert_eq!(snap.history[0].role, HistoryRole::User);
        assert!(snap.history.len() <= 10);
    }

    #[test]
    fn detach_unbinds_sessions() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = conn(&reg);
        let (b, _rb) = conn(&reg);
        let (c, _rc) = conn(&reg);
        reg.attach_session(&a, "db-a".into(), vec![], 10);
        reg.attach_session(&b, "db-b".into(), vec![], 10);
        assert_eq!(reg.detach_session("db-a").as_deref(), Some(a.as_str()));
        assert!(reg.session(&a).is_none());
        assert!(reg.detach_session("db-a").is_none());
        assert_eq!(reg.detach_all(), vec![b.clone()]);
        assert!(reg.session(&b).is_none());
        assert!(reg.session(&c).is_none());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn released_role_can_be_claimed_again() {
        let reg = ConnectionRegistry::new();
        let (id, _rx) = conn(&reg);
        assert!(reg.claim_role(&id, ClientRole::Chatbot));
        reg.release_role(&id);
        assert_eq!(reg.role(&id), None);
        assert!(reg.claim_role(&id, ClientRole::Chatbot));
    }
}
