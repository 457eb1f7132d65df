use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::anthropic::GenerationError;
use crate::error::StoryError;
use crate::models::StoryRecord;

#[derive(Debug)]
struct Session {
    stories: Vec<StoryRecord>,
    in_flight: Option<InFlight>,
    last_seen: Instant,
}

impl Session {
    fn new() -> Self {
        Self { stories: Vec::new(), in_flight: None, last_seen: Instant::now() }
    }

    fn cancel_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    fn story_mut(&mut self, id: Uuid) -> Result<&mut StoryRecord, StoryError> {
        self.stories
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoryError::StoryNotFound(id))
    }
}

#[derive(Debug)]
struct InFlight {
    id: Uuid,
    token: CancellationToken,
}

type Sessions = Arc<RwLock<HashMap<Uuid, Session>>>;

/// Looks up a session and marks it as used.
fn touch(sessions: &mut HashMap<Uuid, Session>, sid: Uuid) -> Result<&mut Session, StoryError> {
    let session = sessions.get_mut(&sid).ok_or(StoryError::SessionNotFound(sid))?;
    session.last_seen = Instant::now();
    Ok(session)
}

/// Shared handle on every session. Locks are held only for map operations,
/// never across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Sessions,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.write().insert(id, Session::new());
        info!("🎯 Created session {}", id);
        id
    }

    /// Cancels any in-flight generation and drops every story. The session
    /// itself stays usable.
    pub fn reset(&self, sid: Uuid) -> Result<usize, StoryError> {
        let mut sessions = self.sessions.write();
        let session = touch(&mut sessions, sid)?;
        session.cancel_in_flight();
        let dropped = session.stories.len();
        session.stories.clear();
        info!("🧹 Reset session {} ({} stories dropped)", sid, dropped);
        Ok(dropped)
    }

    /// Ends the session: cancels its generation and forgets it entirely.
    pub fn close(&self, sid: Uuid) -> Result<usize, StoryError> {
        let mut session = self.sessions.write().remove(&sid).ok_or(StoryError::SessionNotFound(sid))?;
        session.cancel_in_flight();
        info!("👋 Closed session {} ({} stories dropped)", sid, session.stories.len());
        Ok(session.stories.len())
    }

    /// Fires the in-flight token, if any. Returns whether something was cancelled.
    pub fn cancel(&self, sid: Uuid) -> Result<bool, StoryError> {
        let mut sessions = self.sessions.write();
        let session = touch(&mut sessions, sid)?;
        match &session.in_flight {
            Some(in_flight) => {
                info!("🛑 Cancelling generation {} in session {}", in_flight.id, sid);
                in_flight.token.cancel();
                Ok(true)
            }
            None => {
                debug!("No generation in flight for session {}", sid);
                Ok(false)
            }
        }
    }

    /// Claims the session's single generation slot.
    pub fn begin_generation(&self, sid: Uuid) -> Result<GenerationTicket, StoryError> {
        let mut sessions = self.sessions.write();
        let session = touch(&mut sessions, sid)?;
        if session.in_flight.is_some() {
            return Err(StoryError::RequestInFlight);
        }
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        session.in_flight = Some(InFlight { id, token: token.clone() });
        Ok(GenerationTicket { sessions: self.sessions.clone(), sid, id, token })
    }

    pub fn list_stories(&self, sid: Uuid) -> Result<Vec<StoryRecord>, StoryError> {
        let mut sessions = self.sessions.write();
        Ok(touch(&mut sessions, sid)?.stories.clone())
    }

    pub fn get_story(&self, sid: Uuid, id: Uuid) -> Result<StoryRecord, StoryError> {
        self.update_story(sid, id, |record| Ok(record.clone()))
    }

    pub fn delete_story(&self, sid: Uuid, id: Uuid) -> Result<(), StoryError> {
        let mut sessions = self.sessions.write();
        let session = touch(&mut sessions, sid)?;
        let before = session.stories.len();
        session.stories.retain(|r| r.id != id);
        if session.stories.len() == before {
            return Err(StoryError::StoryNotFound(id));
        }
        Ok(())
    }

    /// Runs `f` against the stored record under the write lock.
    pub fn update_story<R>(
        &self,
        sid: Uuid,
        id: Uuid,
        f: impl FnOnce(&mut StoryRecord) -> Result<R, StoryError>,
    ) -> Result<R, StoryError> {
        let mut sessions = self.sessions.write();
        f(touch(&mut sessions, sid)?.story_mut(id)?)
    }

    /// Drops every session idle for at least `ttl`. Returns how many went.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.evict_idle_at(Instant::now(), ttl)
    }

    fn evict_idle_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        // a running generation keeps its session alive
        sessions.retain(|sid, session| {
            let keep = session.in_flight.is_some() || now.saturating_duration_since(session.last_seen) < ttl;
            if !keep {
                debug!("Evicting idle session {}", sid);
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("🧹 Evicted {} idle session(s), {} remain", evicted, sessions.len());
        }
        evicted
    }

    /// Spawns the background task that evicts idle sessions every `ttl / 2`.
    pub fn spawn_idle_sweeper(&self, ttl: Duration) -> JoinHandle<()> {
        let store = self.clone();
        let period = (ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.evict_idle(ttl);
            }
        })
    }
}

/// Holds a session's generation slot; dropping it (normal return, error or a
/// client disconnect dropping the handler future) frees the slot.
#[derive(Debug)]
pub struct GenerationTicket {
    sessions: Sessions,
    sid: Uuid,
    id: Uuid,
    token: CancellationToken,
}

impl GenerationTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails with `Cancelled` when the session was reset or cancelled while the
    /// call was running, so the caller discards the result.
    fn ensure_live(&self) -> Result<(), StoryError> {
        if self.token.is_cancelled() {
            info!("🗑️ Discarding result of cancelled generation {}", self.id);
            return Err(GenerationError::Cancelled.into());
        }
        Ok(())
    }

    /// Stores a freshly generated record. The cancellation check and the insert
    /// happen under one write lock, so a concurrent reset always wins.
    pub fn insert_story(&self, record: StoryRecord) -> Result<(), StoryError> {
        let mut sessions = self.sessions.write();
        self.ensure_live()?;
        touch(&mut sessions, self.sid)?.stories.push(record);
        Ok(())
    }

    /// Like [`SessionStore::update_story`], but refuses once the slot was cancelled.
    pub fn update_story<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut StoryRecord) -> Result<R, StoryError>,
    ) -> Result<R, StoryError> {
        let mut sessions = self.sessions.write();
        self.ensure_live()?;
        f(touch(&mut sessions, self.sid)?.story_mut(id)?)
    }
}

impl Drop for GenerationTicket {
    fn drop(&mut self) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&self.sid) {
            // a reset may already have handed the slot to a newer generation
            if session.in_flight.as_ref().is_some_and(|f| f.id == self.id) {
                session.in_flight = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GeneratedStory, StoryRequest};

    fn record(title: &str) -> StoryRecord {
        let story = GeneratedStory { title: title.into(), ..Default::default() };
        StoryRecord::new(StoryRequest::default(), story, vec![])
    }

    fn store_with(title: &str) -> (SessionStore, Uuid, Uuid) {
        let store = SessionStore::new();
        let sid = store.create();
        let rec = record(title);
        let id = rec.id;
        store.begin_generation(sid).unwrap().insert_story(rec).unwrap();
        (store, sid, id)
    }

    #[test]
    fn second_generation_is_rejected_until_ticket_drops() {
        let store = SessionStore::new();
        let sid = store.create();
        let ticket = store.begin_generation(sid).unwrap();
        assert!(matches!(store.begin_generation(sid), Err(StoryError::RequestInFlight)));
        drop(ticket);
        assert!(store.begin_generation(sid).is_ok());
    }

    #[test]
    fn sessions_do_not_share_the_slot() {
        let store = SessionStore::new();
        let a = store.create();
        let b = store.create();
        let _ticket = store.begin_generation(a).unwrap();
        assert!(store.begin_generation(b).is_ok());
    }

    #[test]
    fn reset_cancels_in_flight_and_drops_stories() {
        let (store, sid, _) = store_with("one");
        let ticket = store.begin_generation(sid).unwrap();

        assert_eq!(store.reset(sid).unwrap(), 1);
        assert!(ticket.token().is_cancelled());
        assert!(matches!(
            ticket.ensure_live(),
            Err(StoryError::Generation(GenerationError::Cancelled))
        ));
        assert!(store.list_stories(sid).unwrap().is_empty());

        // the slot is free again; dropping the stale ticket must not clear the new one
        let fresh = store.begin_generation(sid).unwrap();
        drop(ticket);
        assert!(matches!(store.begin_generation(sid), Err(StoryError::RequestInFlight)));
        drop(fresh);
    }

    #[test]
    fn result_landing_after_a_reset_is_not_stored() {
        let (store, sid, id) = store_with("kept");
        let ticket = store.begin_generation(sid).unwrap();
        store.reset(sid).unwrap();

        let err = ticket.insert_story(record("late")).unwrap_err();
        assert!(matches!(err, StoryError::Generation(GenerationError::Cancelled)));
        assert!(store.list_stories(sid).unwrap().is_empty());
        assert!(matches!(
            ticket.update_story(id, |r| Ok(r.clone())),
            Err(StoryError::Generation(GenerationError::Cancelled))
        ));
    }

    #[test]
    fn cancel_reports_whether_anything_was_running() {
        let store = SessionStore::new();
        let sid = store.create();
        assert!(!store.cancel(sid).unwrap());
        let ticket = store.begin_generation(sid).unwrap();
        assert!(store.cancel(sid).unwrap());
        assert!(ticket.token().is_cancelled());
    }

    #[test]
    fn story_crud() {
        let (store, sid, id) = store_with("one");
        assert_eq!(store.get_story(sid, id).unwrap().story.title, "one");

        store
            .update_story(sid, id, |r| {
                r.story.title = "renamed".into();
                Ok(())
            })
            .unwrap();
        assert_eq!(store.list_stories(sid).unwrap()[0].story.title, "renamed");

        store.delete_story(sid, id).unwrap();
        assert!(matches!(store.get_story(sid, id), Err(StoryError::StoryNotFound(_))));
        assert!(matches!(store.delete_story(sid, id), Err(StoryError::StoryNotFound(_))));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let store = SessionStore::new();
        let missing = Uuid::new_v4();
        assert!(matches!(store.list_stories(missing), Err(StoryError::SessionNotFound(_))));
        assert!(matches!(store.begin_generation(missing), Err(StoryError::SessionNotFound(_))));
        assert!(matches!(store.close(missing), Err(StoryError::SessionNotFound(_))));
    }

    #[test]
    fn close_forgets_the_session_and_cancels_its_generation() {
        let (store, sid, _) = store_with("one");
        let ticket = store.begin_generation(sid).unwrap();
        assert_eq!(store.close(sid).unwrap(), 1);
        assert!(ticket.token().is_cancelled());
        assert!(matches!(store.list_stories(sid), Err(StoryError::SessionNotFound(_))));
        // dropping a ticket for a closed session is harmless
        drop(ticket);
    }

    #[test]
    fn idle_sessions_are_evicted_unless_generating() {
        let store = SessionStore::new();
        let idle = store.create();
        let busy = store.create();
        let _ticket = store.begin_generation(busy).unwrap();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.evict_idle_at(Instant::now(), ttl), 0);
        let later = Instant::now() + ttl + Duration::from_secs(1);
        assert_eq!(store.evict_idle_at(later, ttl), 1);
        assert!(matches!(store.list_stories(idle), Err(StoryError::SessionNotFound(_))));
        assert!(store.list_stories(busy).is_ok());
    }

    #[tokio::test]
    async fn sweeper_drops_sessions_in_the_background() {
        let store = SessionStore::new();
        let sid = store.create();
        let sweeper = store.spawn_idle_sweeper(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(200)).await;
        sweeper.abort();
        assert!(matches!(store.list_stories(sid), Err(StoryError::SessionNotFound(_))));
    }
}
