//! Real-time meeting orchestrator.
//!
//! Each meeting runs as its own cooperative task owning the transcript and a
//! broadcast channel of events. The advisor agent speaks first to frame the
//! meeting; the rest follow in round-robin order. Token deltas stream to
//! every subscriber as they arrive. Human interjections queue between turns;
//! a raised hand interrupts the current speaker at the end of the current
//! sentence and yields the floor to the queued human messages. Voice input
//! goes through the transcription adapter and joins the queue when
//! non-empty.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::StreamDelta;
use crate::stt::Transcriber;

/// Keepalive cadence for subscribers.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Rounds of agent turns after the advisor's framing turn.
const DEFAULT_ROUNDS: usize = 3;

/// One participant in a meeting.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingAgent {
    pub id: Uuid,
    pub name: String,
    pub system_prompt: String,
}

/// A transcript entry, in speaking order.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent { id: Uuid, name: String },
    Human,
}

/// Events streamed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeetingEvent {
    TurnStart { agent_id: Uuid, name: String },
    Delta { agent_id: Uuid, token: String },
    TurnEnd { agent_id: Uuid, text: String },
    HumanInjected { text: String },
    MeetingEnd,
    Ping,
}

/// Parameters for starting a meeting.
#[derive(Debug, Clone)]
pub struct MeetingSpec {
    pub team_id: Uuid,
    pub meeting_type: String,
    pub title: String,
    pub agents: Vec<MeetingAgent>,
    pub advisor: MeetingAgent,
    pub company_name: Option<String>,
    pub rounds: usize,
}

impl MeetingSpec {
    pub fn meet_and_greet(
        team_id: Uuid,
        title: String,
        agents: Vec<MeetingAgent>,
        advisor: MeetingAgent,
        company_name: Option<String>,
    ) -> Self {
        Self {
            team_id,
            meeting_type: "meet-and-greet".into(),
            title,
            agents,
            advisor,
            company_name,
            rounds: DEFAULT_ROUNDS,
        }
    }
}

/// Streams one agent's turn given the transcript so far. The engine backs
/// this with the model router and the streaming chat client.
#[async_trait]
pub trait TurnStream: Send + Sync {
    async fn stream_turn(
        &self,
        spec: &MeetingSpec,
        agent: &MeetingAgent,
        transcript: &[TranscriptEntry],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamDelta>>;
}

/// A live meeting.
#[derive(Debug)]
pub struct Meeting {
    pub id: Uuid,
    pub team_id: Uuid,
    spec: MeetingSpec,
    events: broadcast::Sender<MeetingEvent>,
    transcript: StdMutex<Vec<TranscriptEntry>>,
    interjections: StdMutex<VecDeque<String>>,
    hand_raised: AtomicBool,
    cancel: CancellationToken,
}

impl Meeting {
    /// Subscribe to the event stream. Slow or dropped subscribers only lose
    /// their own events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeetingEvent> {
        self.events.subscribe()
    }

    /// Queue a human text message; it is injected between turns.
    pub fn post_human_message(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::invalid("message must not be empty"));
        }
        self.interjections
            .lock()
            .expect("interjection queue poisoned")
            .push_back(text.to_string());
        Ok(())
    }

    /// Interrupt the current speaker at the next sentence boundary.
    pub fn raise_hand(&self) {
        self.hand_raised.store(true, Ordering::SeqCst);
    }

    /// Feed voice audio through the transcriber; non-empty text joins the
    /// interjection queue.
    pub async fn post_voice(
        &self,
        transcriber: &dyn Transcriber,
        audio: &[u8],
    ) -> Result<Option<String>> {
        let text = transcriber
            .transcribe(audio, "interjection.wav", &self.cancel)
            .await
            .map_err(EngineError::Model)?;
        if text.is_empty() {
            return Ok(None);
        }
        self.post_human_message(&text)?;
        Ok(Some(text))
    }

    /// End the meeting: the turn loop stops at its next check.
    pub fn end(&self) {
        self.cancel.cancel();
    }

    /// Copy of the transcript so far.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().expect("transcript poisoned").clone()
    }

    fn emit(&self, event: MeetingEvent) {
        // No subscribers is fine; the transcript still records everything.
        let _ = self.events.send(event);
    }

    fn drain_interjections(&self) {
        let queued: Vec<String> = {
            let mut queue = self
                .interjections
                .lock()
                .expect("interjection queue poisoned");
            queue.drain(..).collect()
        };
        for text in queued {
            self.emit(MeetingEvent::HumanInjected { text: text.clone() });
            self.transcript
                .lock()
                .expect("transcript poisoned")
                .push(TranscriptEntry {
                    speaker: Speaker::Human,
                    text,
                });
        }
        self.hand_raised.store(false, Ordering::SeqCst);
    }

    /// Run one agent turn, streaming deltas. Returns `false` when the
    /// meeting was cancelled mid-turn.
    async fn run_turn(&self, streams: &dyn TurnStream, agent: &MeetingAgent) -> bool {
        self.emit(MeetingEvent::TurnStart {
            agent_id: agent.id,
            name: agent.name.clone(),
        });

        let transcript_snapshot = self.transcript();
        let mut rx = match streams
            .stream_turn(&self.spec, agent, &transcript_snapshot, &self.cancel)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "Turn stream failed to start");
                self.emit(MeetingEvent::TurnEnd {
                    agent_id: agent.id,
                    text: String::new(),
                });
                return !self.cancel.is_cancelled();
            }
        };

        let mut text = String::new();
        loop {
            let delta = tokio::select! {
                delta = rx.recv() => delta,
                _ = self.cancel.cancelled() => None,
            };
            match delta {
                Some(StreamDelta::Token(token)) => {
                    text.push_str(&token);
                    self.emit(MeetingEvent::Delta {
                        agent_id: agent.id,
                        token,
                    });
                    // A raised hand interrupts at the end of the current
                    // sentence.
                    if self.hand_raised.load(Ordering::SeqCst) && ends_sentence(&text) {
                        debug!(agent = %agent.name, "Turn interrupted by raised hand");
                        break;
                    }
                }
                Some(StreamDelta::Failed(message)) => {
                    warn!(agent = %agent.name, error = %message, "Turn stream failed");
                    break;
                }
                Some(StreamDelta::Done) | None => break,
            }
        }

        self.transcript
            .lock()
            .expect("transcript poisoned")
            .push(TranscriptEntry {
                speaker: Speaker::Agent {
                    id: agent.id,
                    name: agent.name.clone(),
                },
                text: text.clone(),
            });
        self.emit(MeetingEvent::TurnEnd {
            agent_id: agent.id,
            text,
        });

        !self.cancel.is_cancelled()
    }

    /// The meeting's turn loop: advisor framing, then round-robin rounds,
    /// draining human interjections between turns.
    async fn run(self: Arc<Self>, streams: Arc<dyn TurnStream>) {
        info!(meeting_id = %self.id, title = %self.spec.title, "Meeting started");

        if !self.run_turn(streams.as_ref(), &self.spec.advisor.clone()).await {
            self.finish();
            return;
        }

        'rounds: for _ in 0..self.spec.rounds {
            for agent in self.spec.agents.clone() {
                self.drain_interjections();
                if !self.run_turn(streams.as_ref(), &agent).await {
                    break 'rounds;
                }
            }
        }
        self.drain_interjections();
        self.finish();
    }

    fn finish(&self) {
        self.emit(MeetingEvent::MeetingEnd);
        self.cancel.cancel();
        info!(meeting_id = %self.id, "Meeting ended");
    }
}

/// Whether the accumulated turn text sits at a sentence boundary.
fn ends_sentence(text: &str) -> bool {
    matches!(
        text.trim_end().chars().last(),
        Some('.') | Some('!') | Some('?')
    )
}

/// The registry of live meetings.
pub struct Meetings {
    streams: Arc<dyn TurnStream>,
    live: StdMutex<std::collections::HashMap<Uuid, Arc<Meeting>>>,
}

impl Meetings {
    pub fn new(streams: Arc<dyn TurnStream>) -> Self {
        Self {
            streams,
            live: StdMutex::new(std::collections::HashMap::new()),
        }
    }

    /// Start a meeting; its loop and keepalive run as supervised tasks.
    pub fn start(&self, spec: MeetingSpec) -> Result<Arc<Meeting>> {
        if spec.agents.is_empty() {
            return Err(EngineError::invalid("a meeting needs at least one agent"));
        }
        let (events, _) = broadcast::channel(256);
        let meeting = Arc::new(Meeting {
            id: Uuid::new_v4(),
            team_id: spec.team_id,
            spec,
            events,
            transcript: StdMutex::new(Vec::new()),
            interjections: StdMutex::new(VecDeque::new()),
            hand_raised: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        self.live
            .lock()
            .expect("meeting map poisoned")
            .insert(meeting.id, Arc::clone(&meeting));

        // Keepalive pings until the meeting ends.
        {
            let meeting = Arc::clone(&meeting);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(PING_INTERVAL) => {
                            meeting.emit(MeetingEvent::Ping);
                        }
                        _ = meeting.cancel.cancelled() => return,
                    }
                }
            });
        }

        let loop_meeting = Arc::clone(&meeting);
        let streams = Arc::clone(&self.streams);
        tokio::spawn(async move {
            loop_meeting.run(streams).await;
        });

        Ok(meeting)
    }

    /// A live meeting by id, tenant-scoped.
    pub fn get(&self, team_id: &Uuid, meeting_id: &Uuid) -> Result<Arc<Meeting>> {
        self.live
            .lock()
            .expect("meeting map poisoned")
            .get(meeting_id)
            .filter(|m| m.team_id == *team_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("meeting"))
    }

    /// Drop a finished meeting from the registry.
    pub fn remove(&self, meeting_id: &Uuid) {
        self.live
            .lock()
            .expect("meeting map poisoned")
            .remove(meeting_id);
    }
}
