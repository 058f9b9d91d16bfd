//! In-process room authority for testing.
//!
//! Holds rooms and activity reports in memory and recomputes progress the
//! way a server of record would. Tests can inject failures into the next
//! mutation and hold mutations or activity fetches until released, to
//! reproduce races between push traffic and a pull request's response.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use copresence_proto::ids::{RoomId, TopicId, UserId};
use copresence_proto::presence::ActivityReport;
use copresence_proto::room::{CompletionResult, MemberProgress, RoomProgress, RoomSnapshot, Topic};

use super::api::{ApiError, RoomApi};

/// Room authority backed by in-memory maps.
pub struct InMemoryRoomApi {
    caller: UserId,
    rooms: Mutex<HashMap<RoomId, RoomSnapshot>>,
    activity: Mutex<HashMap<UserId, ActivityReport>>,
    fail_next: Mutex<Option<ApiError>>,
    hold: Mutex<Option<Arc<Semaphore>>>,
    hold_activity: Mutex<Option<Arc<Semaphore>>>,
    fetches: AtomicUsize,
    activity_fetches: AtomicUsize,
    mutations: AtomicUsize,
}

impl InMemoryRoomApi {
    /// Creates an empty authority acting on behalf of `caller`.
    #[must_use]
    pub fn new(caller: UserId) -> Self {
        Self {
            caller,
            rooms: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
            hold: Mutex::new(None),
            hold_activity: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            activity_fetches: AtomicUsize::new(0),
            mutations: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a room, recomputing its progress.
    pub fn put_room(&self, mut snapshot: RoomSnapshot) {
        recompute(&mut snapshot);
        self.rooms.lock().insert(snapshot.room_id.clone(), snapshot);
    }

    /// Current authoritative state of a room.
    #[must_use]
    pub fn room(&self, room: &RoomId) -> Option<RoomSnapshot> {
        self.rooms.lock().get(room).cloned()
    }

    /// Record a completion by another member, as if done from another client.
    pub fn complete_as(&self, room: &RoomId, topic: &TopicId, user: &UserId) {
        let mut rooms = self.rooms.lock();
        if let Some(snapshot) = rooms.get_mut(room) {
            if let Some(t) = snapshot.topic_mut(topic) {
                t.completed_by.insert(user.clone());
            }
            recompute(snapshot);
        }
    }

    /// Store an activity report as if another client had posted it.
    pub fn put_activity(&self, report: ActivityReport) {
        self.activity.lock().insert(report.user_id.clone(), report);
    }

    /// Make the next mutation fail with `error`.
    pub fn fail_next_mutation(&self, error: ApiError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Hold every mutation until [`release_mutations`](Self::release_mutations).
    pub fn hold_mutations(&self) {
        *self.hold.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held mutations proceed.
    pub fn release_mutations(&self) {
        if let Some(gate) = self.hold.lock().take() {
            gate.close();
        }
    }

    /// Hold every activity fetch until
    /// [`release_activity_fetches`](Self::release_activity_fetches).
    pub fn hold_activity_fetches(&self) {
        *self.hold_activity.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held activity fetches proceed.
    pub fn release_activity_fetches(&self) {
        if let Some(gate) = self.hold_activity.lock().take() {
            gate.close();
        }
    }

    /// Number of `fetch_activity` calls received, held ones included.
    pub fn activity_fetch_count(&self) -> usize {
        self.activity_fetches.load(Ordering::SeqCst)
    }

    /// Number of `fetch_room` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of mutations received (including failed ones).
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    async fn mutate(&self, room: &RoomId, topic: &TopicId, complete: bool) -> Result<CompletionResult, ApiError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let gate = self.hold.lock().clone();
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        let mut rooms = self.rooms.lock();
        let snapshot = rooms
            .get_mut(room)
            .ok_or_else(|| ApiError::Validation(format!("unknown room {room}")))?;
        let entry = snapshot
            .topic_mut(topic)
            .ok_or_else(|| ApiError::Validation(format!("unknown topic {topic}")))?;
        if complete {
            entry.completed_by.insert(self.caller.clone());
        } else {
            entry.completed_by.remove(&self.caller);
        }
        let completed_by = entry.completed_by.clone();
        recompute(snapshot);

        let percent = snapshot
            .member(&self.caller)
            .map_or(0.0, |m| m.progress_percent);
        Ok(CompletionResult {
            topic_id: topic.clone(),
            completed_by,
            member: MemberProgress {
                user_id: self.caller.clone(),
                percent,
            },
            progress: snapshot.progress.clone(),
        })
    }
}

impl RoomApi for InMemoryRoomApi {
    async fn fetch_room(&self, room: &RoomId) -> Result<RoomSnapshot, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.rooms
            .lock()
            .get(room)
            .cloned()
            .ok_or_else(|| ApiError::Server {
                status: 404,
                body: format!("unknown room {room}"),
            })
    }

    async fn complete_topic(&self, room: &RoomId, topic: &TopicId) -> Result<CompletionResult, ApiError> {
        self.mutate(room, topic, true).await
    }

    async fn reopen_topic(&self, room: &RoomId, topic: &TopicId) -> Result<CompletionResult, ApiError> {
        self.mutate(room, topic, false).await
    }

    async fn fetch_activity(&self, user: &UserId) -> Result<Option<ActivityReport>, ApiError> {
        self.activity_fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.hold_activity.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        Ok(self.activity.lock().get(user).cloned())
    }

    async fn post_activity(&self, report: &ActivityReport) -> Result<(), ApiError> {
        self.put_activity(report.clone());
        Ok(())
    }
}

fn count_topics(topics: &[Topic], total: &mut u32, completed: &mut u32) {
    for topic in topics {
        *total += 1;
        if !topic.completed_by.is_empty() {
            *completed += 1;
        }
        count_topics(&topic.subtopics, total, completed);
    }
}

fn count_for(topics: &[Topic], user: &UserId) -> u32 {
    topics
        .iter()
        .map(|t| u32::from(t.completed_by.contains(user)) + count_for(&t.subtopics, user))
        .sum()
}

/// Recompute member and room progress from the roadmap.
fn recompute(snapshot: &mut RoomSnapshot) {
    let (mut total, mut completed) = (0, 0);
    count_topics(&snapshot.roadmap, &mut total, &mut completed);

    let roadmap = &snapshot.roadmap;
    for member in &mut snapshot.members {
        member.progress_percent = if total == 0 {
            0.0
        } else {
            f64::from(count_for(roadmap, &member.user_id)) * 100.0 / f64::from(total)
        };
    }
    let overall = if snapshot.members.is_empty() {
        0.0
    } else {
        snapshot.members.iter().map(|m| m.progress_percent).sum::<f64>()
            / f64::from(u32::try_from(snapshot.members.len()).unwrap_or(u32::MAX))
    };
    snapshot.progress = RoomProgress {
        overall_percent: overall,
        completed_topics: completed,
        total_topics: total,
    };
}
