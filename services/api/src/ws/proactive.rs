//! Proactive Scheduler
//!
//! Per-session timers that run independently of turns. Timers never touch the
//! session directly: each tick is posted to the session mailbox and the actor
//! decides, under its own serialization, whether the tick turns into a message.
//! Every timer hangs off one cancellation token, so the whole group stops at
//! once on teardown.

use super::actor::SessionEvent;
use super::protocol::ProactiveKind;
use crate::config::ProactiveConfig;
use chrono::{DateTime, Utc};
use companion_core::tools::ToolEffect;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a reminder is about. Each subject is announced at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Event(String),
    Task(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProactiveEvent {
    Greeting,
    TaskCheck,
    EventCheck,
    IdleAnimation,
    BreakReminder,
    Suggestion,
    /// A one-shot notification scheduled by a tool side effect. `at` is the
    /// event start or task due time.
    Reminder {
        kind: ProactiveKind,
        text: String,
        subject: Subject,
        at: DateTime<Utc>,
    },
}

/// Whole minutes until something happens, rounded up and never zero.
pub fn minutes_until(remaining: Duration) -> u64 {
    remaining.as_secs().div_ceil(60).max(1)
}

pub struct ProactiveScheduler {
    token: CancellationToken,
    mailbox: mpsc::Sender<SessionEvent>,
    config: ProactiveConfig,
}

impl ProactiveScheduler {
    /// `token` is usually a child of the connection token.
    pub fn new(
        token: CancellationToken,
        mailbox: mpsc::Sender<SessionEvent>,
        config: ProactiveConfig,
    ) -> Self {
        Self {
            token,
            mailbox,
            config,
        }
    }

    /// Arms the one-time greeting and every periodic timer.
    pub fn start(&self) {
        let c = &self.config;
        self.schedule_once(c.greeting_delay, ProactiveEvent::Greeting);
        self.every(c.task_check_interval, ProactiveEvent::TaskCheck);
        self.every(c.event_check_interval, ProactiveEvent::EventCheck);
        self.every(c.idle_animation_interval, ProactiveEvent::IdleAnimation);
        self.every(c.break_reminder_interval, ProactiveEvent::BreakReminder);
        self.every(c.suggestion_interval, ProactiveEvent::Suggestion);
    }

    pub fn schedule_once(&self, delay: Duration, event: ProactiveEvent) {
        let token = self.token.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep(delay) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = mailbox.send(SessionEvent::Proactive(event)) => {}
                    }
                }
            }
        });
    }

    /// Ticks are dropped, not queued, when the session is busy.
    fn every(&self, period: Duration, event: ProactiveEvent) {
        if period.is_zero() {
            return;
        }
        let token = self.token.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match mailbox.try_send(SessionEvent::Proactive(event.clone())) {
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!(?event, "Mailbox full, proactive tick skipped");
                            }
                            Ok(()) => {}
                        }
                    }
                }
            }
        });
    }

    /// Reacts to a tool side effect by arming a one-shot reminder.
    pub fn notify(&self, effect: &ToolEffect, now: DateTime<Utc>) {
        match effect {
            ToolEffect::EventCreated { id, title, start } => {
                if *start <= now {
                    return;
                }
                let until_start = (*start - now).to_std().unwrap_or_default();
                let lead = self.config.event_reminder_lead.min(until_start);
                let minutes = minutes_until(lead);
                let text = format!("Heads up, \"{title}\" starts in {minutes} minutes.");
                debug!(%title, ?lead, "Event reminder armed");
                self.schedule_once(
                    until_start - lead,
                    ProactiveEvent::Reminder {
                        kind: ProactiveKind::EventReminder,
                        text,
                        subject: Subject::Event(id.clone()),
                        at: *start,
                    },
                );
            }
            ToolEffect::TaskCreated {
                id,
                title,
                due: Some(due),
            } if *due > now => {
                let delay = (*due - now).to_std().unwrap_or_default();
                debug!(%title, ?delay, "Task due reminder armed");
                self.schedule_once(
                    delay,
                    ProactiveEvent::Reminder {
                        kind: ProactiveKind::TaskReminder,
                        text: format!("\"{title}\" is due now."),
                        subject: Subject::Task(id.clone()),
                        at: *due,
                    },
                );
            }
            ToolEffect::TaskCreated { .. } => {}
        }
    }

    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduler(config: ProactiveConfig) -> (ProactiveScheduler, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ProactiveScheduler::new(CancellationToken::new(), tx, config), rx)
    }

    fn proactive(event: Option<SessionEvent>) -> ProactiveEvent {
        match event {
            Some(SessionEvent::Proactive(event)) => event,
            _ => panic!("expected a proactive event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_fires_once_before_the_periodic_timers() {
        let (scheduler, mut rx) = scheduler(ProactiveConfig::default());
        let started = Instant::now();
        scheduler.start();

        assert_eq!(proactive(rx.recv().await), ProactiveEvent::Greeting);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        assert_eq!(proactive(rx.recv().await), ProactiveEvent::IdleAnimation);
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert_eq!(proactive(rx.recv().await), ProactiveEvent::IdleAnimation);
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_stops_every_timer() {
        let (scheduler, mut rx) = scheduler(ProactiveConfig::default());
        scheduler.start();
        scheduler.cancel_all();
        assert!(scheduler.is_cancelled());

        let next = time::timeout(Duration::from_secs(24 * 3600), rx.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn event_reminder_fires_ahead_of_the_start() {
        let (scheduler, mut rx) = scheduler(ProactiveConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 3, 13, 14, 0, 0).unwrap();
        let started = Instant::now();
        scheduler.notify(
            &ToolEffect::EventCreated {
                id: "evt-1".into(),
                title: "Sync".into(),
                start: now + chrono::Duration::hours(1),
            },
            now,
        );

        let event = proactive(rx.recv().await);
        assert_eq!(started.elapsed(), Duration::from_secs(50 * 60));
        assert_eq!(
            event,
            ProactiveEvent::Reminder {
                kind: ProactiveKind::EventReminder,
                text: "Heads up, \"Sync\" starts in 10 minutes.".into(),
                subject: Subject::Event("evt-1".into()),
                at: now + chrono::Duration::hours(1),
            }
        );
    }

    #[test]
    fn minutes_round_up() {
        assert_eq!(minutes_until(Duration::from_secs(7 * 60 + 59)), 8);
        assert_eq!(minutes_until(Duration::from_secs(10 * 60)), 10);
        assert_eq!(minutes_until(Duration::from_secs(5)), 1);
        assert_eq!(minutes_until(Duration::ZERO), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_without_a_due_time_arm_nothing() {
        let (scheduler, mut rx) = scheduler(ProactiveConfig::default());
        let now = Utc::now();
        scheduler.notify(
            &ToolEffect::TaskCreated {
                id: "task-1".into(),
                title: "Buy milk".into(),
                due: None,
            },
            now,
        );
        scheduler.notify(
            &ToolEffect::EventCreated {
                id: "evt-0".into(),
                title: "Past".into(),
                start: now - chrono::Duration::minutes(1),
            },
            now,
        );
        let next = time::timeout(Duration::from_secs(3600), rx.recv()).await;
        assert!(next.is_err());
    }
}
