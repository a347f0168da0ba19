//! Heartbeat scheduler — staggered per-agent recurring execution.
//!
//! One in-process timer map, mutated only through `start`, `stop`,
//! `schedule`, `unschedule`, and `trigger_now`, all guarded by a mutex.
//! Agents in the same `(tenant, period)` bucket start at offsets spaced
//! `floor(period / n)` apart; after the first fire each recurs on its own
//! period. Ticks run as independent tasks and may overlap a late previous
//! tick. Gates (billing, credits, active hours) are checked at tick time,
//! never at scheduling time.

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityLog, event};
use crate::agents::{Agent, AgentStatus, Agents};
use crate::chat::{Chat, ScheduleTrigger, SenderKind};
use crate::credits::Credits;
use crate::error::{EngineError, Result};
use crate::models::ModelRouter;
use crate::store::Store;

/// The sentinel a proactive run returns when it has nothing worth saying.
pub const NO_OP_SENTINEL: &str = "[no-op]";

/// The structured self-review prompt for proactive heartbeats.
pub const PROACTIVE_PROMPT: &str = "\
This is your scheduled heartbeat. Work through it in order:\n\
1. Assess: review your task board, unread channel activity, and goals. \
The think tool is a good first call.\n\
2. Prioritize: pick the highest-impact items you can move now.\n\
3. Plan: decide the concrete steps.\n\
4. Execute: take the steps with your tools.\n\
If nothing needs doing, reply with exactly [no-op].";

/// Runs the proactive invocation for one heartbeat. The engine assembles
/// the full runtime (model resolution, tool set) behind this seam.
#[async_trait]
pub trait HeartbeatRunner: Send + Sync {
    async fn run_heartbeat(
        &self,
        agent: &Agent,
        team_id: &Uuid,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Why a tick was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TenantInactive,
    InsufficientCredits { required: i64, balance: i64 },
    OutsideActiveHours { hour: u8 },
    NotProactive,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TenantInactive => write!(f, "tenant inactive"),
            SkipReason::InsufficientCredits { required, balance } => {
                write!(f, "needs {required} credits, balance {balance}")
            }
            SkipReason::OutsideActiveHours { hour } => {
                write!(f, "hour {hour} outside active window")
            }
            SkipReason::NotProactive => write!(f, "agent not proactive"),
        }
    }
}

struct TimerEntry {
    team_id: Uuid,
    period_secs: u32,
    handle: JoinHandle<()>,
}

/// The heartbeat scheduler.
pub struct Scheduler {
    store: Arc<Store>,
    agents: Arc<Agents>,
    credits: Arc<Credits>,
    activity: Arc<ActivityLog>,
    chat: Arc<Chat>,
    router: Arc<ModelRouter>,
    runner: Arc<dyn HeartbeatRunner>,
    hosted: bool,
    timers: Mutex<HashMap<Uuid, TimerEntry>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        agents: Arc<Agents>,
        credits: Arc<Credits>,
        activity: Arc<ActivityLog>,
        chat: Arc<Chat>,
        router: Arc<ModelRouter>,
        runner: Arc<dyn HeartbeatRunner>,
        hosted: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            agents,
            credits,
            activity,
            chat,
            router,
            runner,
            hosted,
            timers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Initial offsets for a bucket of `n` agents with period `p`:
    /// `{k * floor(p / n)}` for `k` in `0..n`.
    pub fn initial_offsets(n: usize, period_secs: u32) -> Vec<u64> {
        if n == 0 {
            return Vec::new();
        }
        let step = (period_secs as u64) / (n as u64);
        (0..n as u64).map(|k| k * step).collect()
    }

    /// Enumerate `running` agents and register staggered timers.
    pub fn start(self: &Arc<Self>) -> Result<usize> {
        let running = self.agents.list_running()?;

        // Bucket by (tenant, period); offsets are assigned within a bucket.
        let mut buckets: HashMap<(Uuid, u32), Vec<Agent>> = HashMap::new();
        for agent in running {
            buckets
                .entry((agent.team_id, agent.heartbeat_seconds))
                .or_default()
                .push(agent);
        }

        let mut scheduled = 0;
        for ((_, period), bucket) in buckets {
            let offsets = Self::initial_offsets(bucket.len(), period);
            for (agent, offset) in bucket.into_iter().zip(offsets) {
                self.register(&agent, offset);
                scheduled += 1;
            }
        }
        info!(count = scheduled, "Scheduler started");
        Ok(scheduled)
    }

    /// Cancel every timer and the shared shutdown token.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let mut timers = self.timers.lock().expect("timer map poisoned");
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
        info!("Scheduler stopped");
    }

    /// (Re)register one agent. Its offset is computed from the bucket's
    /// current membership; already-scheduled agents keep their timers.
    pub fn schedule(self: &Arc<Self>, agent: &Agent) {
        if agent.status != AgentStatus::Running {
            debug!(agent_id = %agent.id, "Refusing to schedule non-running agent");
            return;
        }
        let peers = {
            let timers = self.timers.lock().expect("timer map poisoned");
            timers
                .iter()
                .filter(|(id, entry)| {
                    **id != agent.id
                        && entry.team_id == agent.team_id
                        && entry.period_secs == agent.heartbeat_seconds
                })
                .count()
        };
        // The newcomer slots in after the existing members; nobody else
        // is rebalanced.
        let offset =
            (peers as u64) * (agent.heartbeat_seconds as u64) / (peers as u64 + 1);
        self.register(agent, offset);
    }

    /// Remove one agent's timer. Survivors keep their original offsets.
    pub fn unschedule(&self, agent_id: &Uuid) {
        let mut timers = self.timers.lock().expect("timer map poisoned");
        if let Some(entry) = timers.remove(agent_id) {
            entry.handle.abort();
            debug!(agent_id = %agent_id, "Agent unscheduled");
        }
    }

    /// Number of live timers.
    pub fn scheduled_count(&self) -> usize {
        self.timers.lock().expect("timer map poisoned").len()
    }

    fn register(self: &Arc<Self>, agent: &Agent, initial_offset_secs: u64) {
        let scheduler = Arc::clone(self);
        let agent_id = agent.id;
        let team_id = agent.team_id;
        let period = agent.heartbeat_seconds;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(initial_offset_secs)) => {}
                _ = shutdown.cancelled() => return,
            }
            loop {
                // Each tick is its own task so a slow tick cannot delay the
                // cadence.
                let tick_scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    tick_scheduler.tick(&agent_id, &team_id).await;
                });
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(period as u64)) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        });

        let mut timers = self.timers.lock().expect("timer map poisoned");
        if let Some(previous) = timers.insert(agent_id, TimerEntry {
            team_id,
            period_secs: period,
            handle,
        }) {
            previous.handle.abort();
        }
        debug!(agent_id = %agent_id, offset_secs = initial_offset_secs, period, "Agent scheduled");
    }

    /// One heartbeat tick. Never panics the scheduler; all failures are
    /// logged and the timer keeps running.
    async fn tick(self: Arc<Self>, agent_id: &Uuid, team_id: &Uuid) {
        let agent = match self.agents.get(team_id, agent_id) {
            Ok(agent) => agent,
            Err(_) => {
                // Deleted since scheduling; drop the timer.
                self.unschedule(agent_id);
                return;
            }
        };
        if agent.status != AgentStatus::Running {
            self.unschedule(agent_id);
            return;
        }

        let hour = Utc::now().hour() as u8;
        if let Some(reason) = self.gate(&agent, hour) {
            if !matches!(reason, SkipReason::NotProactive) {
                debug!(agent_id = %agent_id, reason = %reason, "Heartbeat skipped");
                let _ = self.activity.record(
                    team_id,
                    Some(agent_id),
                    event::HEARTBEAT_SKIPPED,
                    &reason.to_string(),
                );
            }
            return;
        }

        let cancel = self.shutdown.child_token();
        match self
            .runner
            .run_heartbeat(&agent, team_id, PROACTIVE_PROMPT, &cancel)
            .await
        {
            Ok(answer) => {
                if answer.contains(NO_OP_SENTINEL) {
                    debug!(agent_id = %agent_id, "Heartbeat no-op discarded");
                    return;
                }
                if let Err(e) = self.persist_heartbeat_output(&agent, team_id, &answer) {
                    warn!(agent_id = %agent_id, error = %e, "Heartbeat output not persisted");
                }
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Heartbeat run failed");
            }
        }
    }

    /// Tick-time gates, separated from wall-clock for testability.
    fn gate(&self, agent: &Agent, hour: u8) -> Option<SkipReason> {
        if self.hosted && self.tenant_inactive(&agent.team_id) {
            return Some(SkipReason::TenantInactive);
        }

        let cost = self.router.cost_per_use(&agent.model_id);
        if cost > 0 && !self.agents.is_free_template(agent) {
            let balance = self.credits.balance(&agent.team_id).unwrap_or(0);
            if balance < cost {
                return Some(SkipReason::InsufficientCredits {
                    required: cost,
                    balance,
                });
            }
        }

        if !agent.is_active_at_hour(hour) {
            return Some(SkipReason::OutsideActiveHours { hour });
        }

        if !agent.proactive {
            return Some(SkipReason::NotProactive);
        }
        None
    }

    /// Hosted-mode inactivity: no active subscription and zero credits.
    fn tenant_inactive(&self, team_id: &Uuid) -> bool {
        let subscribed = self
            .store
            .with_conn(|conn| {
                conn.prepare_cached(
                    "SELECT 1 FROM subscriptions WHERE team_id = ?1 AND active = 1",
                )?
                .exists([team_id.to_string()])
            })
            .unwrap_or(false);
        if subscribed {
            return false;
        }
        self.credits.balance(team_id).unwrap_or(0) <= 0
    }

    fn persist_heartbeat_output(&self, agent: &Agent, team_id: &Uuid, answer: &str) -> Result<()> {
        let dm = self.chat.dm_channel(team_id, &agent.id)?;
        self.chat.post_message(
            team_id,
            &dm.id,
            SenderKind::Agent,
            &agent.id.to_string(),
            answer,
        )?;
        self.activity.record(
            team_id,
            Some(&agent.id),
            event::HEARTBEAT_PROACTIVE,
            &format!("posted to {}", dm.name),
        )?;
        Ok(())
    }

    #[cfg(test)]
    async fn tick_for_test(self: &Arc<Self>, agent_id: &Uuid, team_id: &Uuid) {
        Arc::clone(self).tick(agent_id, team_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::NewAgent;
    use crate::config::ModelsConfig;
    use std::sync::Mutex as StdMutex;

    struct MockRunner {
        answer: StdMutex<String>,
        runs: StdMutex<Vec<Uuid>>,
    }

    impl MockRunner {
        fn new(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: StdMutex::new(answer.to_string()),
                runs: StdMutex::new(Vec::new()),
            })
        }

        fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HeartbeatRunner for MockRunner {
        async fn run_heartbeat(
            &self,
            agent: &Agent,
            _team_id: &Uuid,
            prompt: &str,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            assert!(prompt.contains("Assess"));
            self.runs.lock().unwrap().push(agent.id);
            Ok(self.answer.lock().unwrap().clone())
        }
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        store: Arc<Store>,
        agents: Arc<Agents>,
        credits: Arc<Credits>,
        activity: Arc<ActivityLog>,
        chat: Arc<Chat>,
        runner: Arc<MockRunner>,
        team: Uuid,
    }

    fn fixture(hosted: bool, answer: &str) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let team = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                    team.to_string()
                ])
            })
            .unwrap();

        let agents = Arc::new(Agents::new(Arc::clone(&store)));
        let credits = Arc::new(Credits::new(Arc::clone(&store)));
        let activity = Arc::new(ActivityLog::new(Arc::clone(&store)));
        let chat = Arc::new(Chat::new(Arc::clone(&store)));
        let router = Arc::new(ModelRouter::new(&ModelsConfig::default(), None));
        let runner = MockRunner::new(answer);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&agents),
            Arc::clone(&credits),
            Arc::clone(&activity),
            Arc::clone(&chat),
            router,
            Arc::clone(&runner) as Arc<dyn HeartbeatRunner>,
            hosted,
        );
        Fixture {
            scheduler,
            store,
            agents,
            credits,
            activity,
            chat,
            runner,
            team,
        }
    }

    fn make_agent(fixture: &Fixture, proactive: bool, heartbeat: u32) -> Agent {
        let agent = fixture
            .agents
            .create(&fixture.team, NewAgent {
                name: "hb".into(),
                proactive,
                heartbeat_seconds: Some(heartbeat),
                model_id: Some("nocost".into()),
                ..NewAgent::default()
            })
            .unwrap();
        fixture
            .agents
            .set_status(&fixture.team, &agent.id, AgentStatus::Running)
            .unwrap()
    }

    #[test]
    fn test_initial_offsets_match_stagger_rule() {
        assert_eq!(Scheduler::initial_offsets(3, 600), vec![0, 200, 400]);
        assert_eq!(Scheduler::initial_offsets(1, 600), vec![0]);
        assert_eq!(Scheduler::initial_offsets(4, 3600), vec![0, 900, 1800, 2700]);
        assert!(Scheduler::initial_offsets(0, 600).is_empty());
    }

    #[tokio::test]
    async fn test_start_schedules_running_agents_only() {
        let fixture = fixture(false, "done");
        make_agent(&fixture, true, 600);
        make_agent(&fixture, true, 600);
        // A stopped agent gets no timer.
        fixture
            .agents
            .create(&fixture.team, NewAgent {
                name: "stopped".into(),
                ..NewAgent::default()
            })
            .unwrap();

        let scheduled = fixture.scheduler.start().unwrap();
        assert_eq!(scheduled, 2);
        assert_eq!(fixture.scheduler.scheduled_count(), 2);
        fixture.scheduler.stop();
    }

    #[tokio::test]
    async fn test_unschedule_leaves_others() {
        let fixture = fixture(false, "done");
        let a = make_agent(&fixture, true, 600);
        let b = make_agent(&fixture, true, 600);
        fixture.scheduler.start().unwrap();

        fixture.scheduler.unschedule(&a.id);
        assert_eq!(fixture.scheduler.scheduled_count(), 1);
        // Removing again is a no-op.
        fixture.scheduler.unschedule(&a.id);
        fixture.scheduler.unschedule(&b.id);
        assert_eq!(fixture.scheduler.scheduled_count(), 0);
        fixture.scheduler.stop();
    }

    #[tokio::test]
    async fn test_proactive_tick_posts_to_dm() {
        let fixture = fixture(false, "Shipped the weekly summary.");
        let agent = make_agent(&fixture, true, 600);

        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;

        assert_eq!(fixture.runner.run_count(), 1);
        let dm = fixture.chat.dm_channel(&fixture.team, &agent.id).unwrap();
        let messages = fixture.chat.messages(&fixture.team, &dm.id, None, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Shipped the weekly summary.");
        assert_eq!(messages[0].sender_kind, SenderKind::Agent);

        let events = fixture.activity.recent(&fixture.team, None, 10).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.event_type == event::HEARTBEAT_PROACTIVE)
        );
    }

    #[tokio::test]
    async fn test_no_op_sentinel_discarded() {
        let fixture = fixture(false, NO_OP_SENTINEL);
        let agent = make_agent(&fixture, true, 600);
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;

        assert_eq!(fixture.runner.run_count(), 1);
        let dm = fixture.chat.dm_channel(&fixture.team, &agent.id).unwrap();
        assert!(
            fixture
                .chat
                .messages(&fixture.team, &dm.id, None, 10)
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_non_proactive_tick_silent() {
        let fixture = fixture(false, "never");
        let agent = make_agent(&fixture, false, 600);
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.runner.run_count(), 0);
        // No skip event is logged for the quiet not-proactive case.
        assert!(
            fixture
                .activity
                .recent(&fixture.team, None, 10)
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_hosted_inactive_tenant_skipped() {
        let fixture = fixture(true, "never");
        let agent = make_agent(&fixture, true, 600);
        // No subscription, zero credits -> inactive.
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.runner.run_count(), 0);
        let events = fixture.activity.recent(&fixture.team, None, 10).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.event_type == event::HEARTBEAT_SKIPPED
                    && e.detail.contains("inactive"))
        );

        // Credits alone re-activate the tenant.
        fixture.credits.grant(&fixture.team, 5, "seed").unwrap();
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.runner.run_count(), 1);
    }

    #[tokio::test]
    async fn test_hosted_subscription_activates_tenant() {
        let fixture = fixture(true, "ok");
        let agent = make_agent(&fixture, true, 600);
        fixture
            .store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO subscriptions (team_id, plan, active) VALUES (?1, 'pro', 1)",
                    [fixture.team.to_string()],
                )
            })
            .unwrap();
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.runner.run_count(), 1);
    }

    #[tokio::test]
    async fn test_costly_model_gated_on_balance() {
        let fixture = fixture(false, "never");
        // "standard" costs 2 credits per use in the router table.
        let agent = fixture
            .agents
            .create(&fixture.team, NewAgent {
                name: "pricey".into(),
                proactive: true,
                model_id: Some("standard".into()),
                ..NewAgent::default()
            })
            .unwrap();
        let agent = fixture
            .agents
            .set_status(&fixture.team, &agent.id, AgentStatus::Running)
            .unwrap();

        fixture.credits.grant(&fixture.team, 1, "seed").unwrap();
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.runner.run_count(), 0);

        let events = fixture.activity.recent(&fixture.team, None, 10).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.event_type == event::HEARTBEAT_SKIPPED
                    && e.detail.contains("credits"))
        );

        fixture.credits.grant(&fixture.team, 5, "seed").unwrap();
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.runner.run_count(), 1);
    }

    #[tokio::test]
    async fn test_active_hours_gate() {
        let fixture = fixture(false, "x");
        let agent = fixture
            .agents
            .create(&fixture.team, NewAgent {
                name: "night-owl".into(),
                proactive: true,
                model_id: Some("nocost".into()),
                active_hours_start: Some(22),
                active_hours_end: Some(6),
                ..NewAgent::default()
            })
            .unwrap();

        assert!(matches!(
            fixture.scheduler.gate(&agent, 12),
            Some(SkipReason::OutsideActiveHours { hour: 12 })
        ));
        assert!(fixture.scheduler.gate(&agent, 23).is_none());
        assert!(fixture.scheduler.gate(&agent, 3).is_none());
    }

    #[tokio::test]
    async fn test_trigger_now_refusals() {
        let fixture = fixture(false, "x");
        let trigger: Arc<Scheduler> = Arc::clone(&fixture.scheduler);

        // Unknown agent.
        assert!(trigger.trigger_now(&Uuid::new_v4(), &fixture.team).is_err());

        // Stopped agent.
        let stopped = fixture
            .agents
            .create(&fixture.team, NewAgent {
                name: "stopped".into(),
                ..NewAgent::default()
            })
            .unwrap();
        assert!(trigger.trigger_now(&stopped.id, &fixture.team).is_err());

        // Cross-tenant wake looks like an unknown agent.
        let running = make_agent(&fixture, true, 600);
        let err = trigger
            .trigger_now(&running.id, &Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);

        // Same-tenant running agent is accepted.
        assert!(trigger.trigger_now(&running.id, &fixture.team).is_ok());
        fixture.scheduler.stop();
    }

    #[tokio::test]
    async fn test_deleted_agent_tick_unschedules() {
        let fixture = fixture(false, "x");
        let agent = make_agent(&fixture, true, 600);
        fixture.scheduler.start().unwrap();
        assert_eq!(fixture.scheduler.scheduled_count(), 1);

        fixture
            .store
            .with_conn(|conn| {
                conn.execute("DELETE FROM agents WHERE id = ?1", [agent.id.to_string()])
            })
            .unwrap();
        fixture
            .scheduler
            .tick_for_test(&agent.id, &fixture.team)
            .await;
        assert_eq!(fixture.scheduler.scheduled_count(), 0);
        fixture.scheduler.stop();
    }
}

impl ScheduleTrigger for Arc<Scheduler> {
    /// Fire one heartbeat immediately by re-registering the agent with a
    /// zero offset. Refuses cross-tenant and non-running targets.
    fn trigger_now(&self, agent_id: &Uuid, team_id: &Uuid) -> Result<()> {
        // The tenant argument scopes the lookup, so a cross-tenant wake is
        // indistinguishable from an unknown agent.
        let agent = self.agents.get(team_id, agent_id)?;
        if agent.status != AgentStatus::Running {
            return Err(EngineError::invalid("agent is not running"));
        }
        self.register(&agent, 0);
        info!(agent_id = %agent_id, "Immediate heartbeat triggered");
        Ok(())
    }
}
