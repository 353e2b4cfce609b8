//! Vote Collector — external-input voting with single-vote-per-user (component G).

use crate::bus::{Event, EventBus, SubscribeOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genre {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voter {
    pub user_id: String,
    pub author: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyEntry {
    pub name: String,
    pub votes: u64,
    pub voters: Vec<Voter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingWindow {
    pub genres: Vec<Genre>,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub tally: HashMap<String, TallyEntry>,
    pub winner: Option<String>,
}

struct State {
    window: Option<VotingWindow>,
    first_vote_at: HashMap<String, DateTime<Utc>>,
    genre_order: HashMap<String, usize>,
    votes_by_user: HashMap<String, String>,
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct VoteCastPayload {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "genreId")]
    genre_id: String,
    #[serde(default)]
    author: String,
}

/// Subscribes itself to `vote:cast` at construction and drives one voting
/// window at a time; a fresh `start_voting` call replaces the prior window.
pub struct VoteCollector {
    bus: Arc<Mutex<EventBus>>,
    state: Arc<Mutex<State>>,
}

impl VoteCollector {
    pub async fn new(bus: Arc<Mutex<EventBus>>) -> Self {
        let state = Arc::new(Mutex::new(State {
            window: None,
            first_vote_at: HashMap::new(),
            genre_order: HashMap::new(),
            votes_by_user: HashMap::new(),
            closed: true,
        }));

        {
            let mut guard = bus.lock().await;
            let cast_state = state.clone();
            let cast_bus = bus.clone();
            guard.subscribe(
                "vote:cast",
                move |event: Event| {
                    let state = cast_state.clone();
                    let bus = cast_bus.clone();
                    async move {
                        let payload: VoteCastPayload = serde_json::from_value(event.payload)
                            .map_err(crate::types::Error::Serialization)?;
                        handle_vote(&state, &bus, payload).await;
                        Ok(())
                    }
                },
                SubscribeOptions::default(),
            );
        }

        Self { bus, state }
    }

    /// Opens a new voting window over `genres` lasting until `close_at`.
    /// Spawns the deadline timer that force-closes voting and emits
    /// `voting:complete`.
    pub async fn start_voting(&self, genres: Vec<Genre>, close_at: DateTime<Utc>) {
        let genre_order: HashMap<String, usize> =
            genres.iter().enumerate().map(|(i, g)| (g.id.clone(), i)).collect();
        let window = VotingWindow {
            genres: genres.clone(),
            open_at: Utc::now(),
            close_at,
            tally: genres
                .into_iter()
                .map(|g| (g.id.clone(), TallyEntry { name: g.name, votes: 0, voters: Vec::new() }))
                .collect(),
            winner: None,
        };
        {
            let mut guard = self.state.lock().await;
            guard.window = Some(window);
            guard.first_vote_at.clear();
            guard.genre_order = genre_order;
            guard.votes_by_user.clear();
            guard.closed = false;
        }

        let state = self.state.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let now = Utc::now();
            if close_at > now {
                let wait = (close_at - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
            }
            close(&state, &bus).await;
        });
    }

    /// Force-close the voting window early; equivalent to the deadline firing.
    pub async fn stop(&self) {
        close(&self.state, &self.bus).await;
    }

    pub async fn get_tally(&self) -> HashMap<String, TallyEntry> {
        self.state.lock().await.window.as_ref().map(|w| w.tally.clone()).unwrap_or_default()
    }

    pub async fn get_winner(&self) -> Option<String> {
        self.state.lock().await.window.as_ref().and_then(|w| w.winner.clone())
    }
}

async fn handle_vote(state: &Arc<Mutex<State>>, bus: &Arc<Mutex<EventBus>>, payload: VoteCastPayload) {
    let mut guard = state.lock().await;
    if guard.closed {
        drop(guard);
        reject(bus, &payload.user_id, &payload.genre_id, "voting window is closed").await;
        return;
    }
    let Some(window) = guard.window.as_mut() else {
        drop(guard);
        reject(bus, &payload.user_id, &payload.genre_id, "no active voting window").await;
        return;
    };
    if !window.tally.contains_key(&payload.genre_id) {
        drop(guard);
        reject(bus, &payload.user_id, &payload.genre_id, "unknown genreId").await;
        return;
    }

    let previous = guard.votes_by_user.get(&payload.user_id).cloned();
    if let Some(prev_genre) = &previous {
        if prev_genre == &payload.genre_id {
            // Re-voting for the same genre is idempotent: no-op beyond bookkeeping.
            return;
        }
        if let Some(window) = guard.window.as_mut() {
            if let Some(entry) = window.tally.get_mut(prev_genre) {
                entry.votes = entry.votes.saturating_sub(1);
                entry.voters.retain(|v| v.user_id != payload.user_id);
            }
        }
    }

    guard.first_vote_at.entry(payload.genre_id.clone()).or_insert_with(Utc::now);
    guard.votes_by_user.insert(payload.user_id.clone(), payload.genre_id.clone());
    if let Some(window) = guard.window.as_mut() {
        if let Some(entry) = window.tally.get_mut(&payload.genre_id) {
            entry.votes += 1;
            entry.voters.push(Voter { user_id: payload.user_id, author: payload.author });
        }
    }
}

async fn reject(bus: &Arc<Mutex<EventBus>>, user_id: &str, genre_id: &str, reason: &str) {
    bus.lock().await.emit(
        "vote:rejected",
        serde_json::json!({ "userId": user_id, "genreId": genre_id, "reason": reason }),
    );
}

async fn close(state: &Arc<Mutex<State>>, bus: &Arc<Mutex<EventBus>>) {
    let mut guard = state.lock().await;
    if guard.closed {
        return;
    }
    guard.closed = true;
    let Some(window) = guard.window.as_mut() else { return };

    let max_votes = window.tally.values().map(|e| e.votes).max().unwrap_or(0);
    let mut contenders: Vec<&String> = window
        .tally
        .iter()
        .filter(|(_, e)| e.votes == max_votes && max_votes > 0)
        .map(|(id, _)| id)
        .collect();

    let first_vote_at = guard.first_vote_at.clone();
    let genre_order = guard.genre_order.clone();
    contenders.sort_by(|a, b| {
        let ta = first_vote_at.get(*a).copied().unwrap_or(DateTime::<Utc>::MAX_UTC);
        let tb = first_vote_at.get(*b).copied().unwrap_or(DateTime::<Utc>::MAX_UTC);
        let oa = genre_order.get(*a).copied().unwrap_or(usize::MAX);
        let ob = genre_order.get(*b).copied().unwrap_or(usize::MAX);
        ta.cmp(&tb).then_with(|| oa.cmp(&ob))
    });

    let winner = contenders.first().map(|s| s.to_string());
    if let Some(window) = guard.window.as_mut() {
        window.winner = winner.clone();
    }
    let tally = window.tally.clone();
    drop(guard);

    bus.lock().await.emit(
        "voting:complete",
        serde_json::json!({ "winner": winner, "tally": tally }),
    );
}
