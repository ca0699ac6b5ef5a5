use anyhow::Result;
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use rand::Rng;

use crate::model::DailySchedule;
use crate::notify::Notifier;
use crate::store::Store;

/// Reminders land somewhere in [09:00, 22:00) local clock time.
const WINDOW_START_HOUR: u32 = 9;
const WINDOW_HOURS: u32 = 13;

/// A fire is only valid this close past the scheduled instant. Narrower than
/// the 60s tick period, so the same instant cannot fire on two ticks.
const FIRE_WINDOW_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Today,
    Tomorrow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Schedule armed for a future instant, or nothing to do.
    Idle,
    /// A missing or stale schedule was (re)generated; no fire this tick.
    Generated,
    /// The daily reminder was dispatched to this many endpoints.
    Fired(usize),
}

/// Pick a uniformly random instant within the reminder window on `target`'s
/// calendar day, in local time.
pub fn pick_instant(now: DateTime<Utc>, target: Target) -> DateTime<Utc> {
    let mut rng = rand::thread_rng();
    let hour = WINDOW_START_HOUR + rng.gen_range(0..WINDOW_HOURS);
    let minute = rng.gen_range(0..60u32);

    let date = match target {
        Target::Today => local_date(now),
        Target::Tomorrow => local_date(now) + Duration::days(1),
    };

    local_instant(date, hour, minute)
}

fn local_instant(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let naive = date.and_hms_opt(hour, minute, 0).expect("valid clock time");

    match Local.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        // Nonexistent local time (DST gap): fall back to reading the wall
        // clock as UTC. The guard is date-based, so this stays safe.
        None => Utc.from_utc_datetime(&naive),
    }
}

/// Calendar comparisons use local server time, like the rest of the app.
fn local_date(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&Local).date_naive()
}

/// Level-triggered decision core driven by two timers. Every tick re-derives
/// its decision from storage, so redundant or skipped ticks are harmless.
#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    notifier: Notifier,
}

impl Dispatcher {
    pub fn new(store: Store, notifier: Notifier) -> Self {
        Dispatcher { store, notifier }
    }

    fn generate(&self, now: DateTime<Utc>, target: Target) -> Result<DailySchedule> {
        let schedule = DailySchedule {
            scheduled_time: pick_instant(now, target),
            generated_at: now,
        };
        self.store.replace_schedule(schedule)?;
        tracing::info!(scheduled_time = %schedule.scheduled_time, "Armed reminder schedule.");

        Ok(schedule)
    }

    /// The per-minute tick. At most one of: lazy self-heal, fire + eager
    /// re-arm, stale regeneration.
    pub async fn minute_tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let schedule = match self.store.schedule()? {
            Some(schedule) => schedule,
            None => {
                // First boot or an unexpected gap. Arm for today and let a
                // later tick fire it.
                self.generate(now, Target::Today)?;
                return Ok(TickOutcome::Generated);
            }
        };

        if now < schedule.scheduled_time {
            return Ok(TickOutcome::Idle);
        }

        let lateness = now - schedule.scheduled_time;
        if lateness < Duration::seconds(FIRE_WINDOW_SECONDS)
            && local_date(schedule.scheduled_time) == local_date(now)
        {
            let delivered = self.notifier.dispatch_daily_reminder().await?;
            tracing::info!(%delivered, "Daily reminder dispatched.");

            // Eager re-arm: tomorrow's instant must not depend on the
            // midnight tick actually running.
            self.generate(now, Target::Tomorrow)?;
            return Ok(TickOutcome::Fired(delivered));
        }

        if local_date(schedule.generated_at) != local_date(now) {
            // Missed window on a record from another day. Regenerate for
            // today instead of firing against a stale schedule.
            self.generate(now, Target::Today)?;
            return Ok(TickOutcome::Generated);
        }

        Ok(TickOutcome::Idle)
    }

    /// The once-a-day backstop: make sure a schedule exists even if dispatch
    /// never fired (no subscribers, downtime). A pending future schedule is
    /// left alone, so this never destroys the eager re-arm's instant.
    pub fn midnight_tick(&self, now: DateTime<Utc>) -> Result<bool> {
        match self.store.schedule()? {
            None => {
                self.generate(now, Target::Tomorrow)?;
                Ok(true)
            }
            Some(schedule)
                if schedule.scheduled_time <= now
                    && local_date(schedule.generated_at) != local_date(now) =>
            {
                self.generate(now, Target::Tomorrow)?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}

/// Spawn the two cooperative timer loops. Neither loop ever exits; failures
/// are logged and retried on the next tick.
pub fn spawn_timers(dispatcher: &Dispatcher) {
    tokio::spawn(minute_loop(dispatcher.clone()));
    tokio::spawn(midnight_loop(dispatcher.clone()));
}

async fn minute_loop(dispatcher: Dispatcher) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));

    loop {
        interval.tick().await;

        if let Err(error) = dispatcher.minute_tick(Utc::now()).await {
            tracing::error!(?error, "Minute tick failed; retrying on the next tick.");
        }
    }
}

async fn midnight_loop(dispatcher: Dispatcher) {
    loop {
        tokio::time::sleep(until_next_local_midnight()).await;

        if let Err(error) = dispatcher.midnight_tick(Utc::now()) {
            tracing::error!(?error, "Midnight tick failed; the per-minute tick will self-heal.");
        }
    }
}

fn until_next_local_midnight() -> std::time::Duration {
    let now = Local::now();
    let next_date = now.date_naive() + Duration::days(1);
    let naive = next_date.and_hms_opt(0, 0, 0).expect("valid clock time");

    match Local
        .from_local_datetime(&naive)
        .earliest()
        .and_then(|next| (next - now).to_std().ok())
    {
        Some(wait) => wait,
        None => std::time::Duration::from_secs(60),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Timelike;

    use super::*;
    use crate::push::testing::StubSender;
    use crate::push::SendOutcome;

    fn at(date: NaiveDate, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        let naive = date.and_hms_opt(hour, minute, second).expect("clock time");
        Local
            .from_local_datetime(&naive)
            .earliest()
            .expect("unambiguous local time")
            .with_timezone(&Utc)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 3).expect("date")
    }

    fn dispatcher_with(store: &Store, sender: StubSender) -> Dispatcher {
        let notifier = Notifier::new(store.clone(), Some(Arc::new(sender)));
        Dispatcher::new(store.clone(), notifier)
    }

    fn subscribe(store: &Store, user: &str) {
        store
            .replace_subscription(
                user,
                &format!("https://push.example/{}", user),
                "p256dh-key",
                "auth-secret",
                Utc::now(),
            )
            .expect("subscribe");
    }

    #[test]
    fn picked_instants_stay_inside_the_window() {
        let now = at(day(), 0, 0, 30);

        for _ in 0..10_000 {
            let instant = pick_instant(now, Target::Tomorrow).with_timezone(&Local);
            assert!(instant.hour() >= 9 && instant.hour() < 22, "hour {}", instant.hour());
            assert_eq!(instant.second(), 0);
            assert_eq!(instant.date_naive(), day() + Duration::days(1));
        }

        for _ in 0..1_000 {
            let instant = pick_instant(now, Target::Today).with_timezone(&Local);
            assert_eq!(instant.date_naive(), day());
        }
    }

    #[tokio::test]
    async fn empty_store_self_heals_without_firing() {
        let store = Store::open_in_memory().expect("store");
        subscribe(&store, "alice");
        let dispatcher = dispatcher_with(&store, StubSender::delivering());

        let outcome = dispatcher
            .minute_tick(at(day(), 12, 0, 0))
            .await
            .expect("tick");

        assert_eq!(outcome, TickOutcome::Generated);
        let schedule = store.schedule().expect("read").expect("present");
        assert_eq!(local_date(schedule.generated_at), day());
        assert_eq!(local_date(schedule.scheduled_time), day());
    }

    #[tokio::test]
    async fn full_cycle_fires_exactly_once_then_rearms() {
        let store = Store::open_in_memory().expect("store");
        subscribe(&store, "alice");
        subscribe(&store, "bob");
        store
            .update_preferences("bob", Some(false), None, Utc::now())
            .expect("opt out");
        let dispatcher = dispatcher_with(&store, StubSender::delivering());

        // Midnight arms tomorrow's instant.
        let generated = dispatcher.midnight_tick(at(day(), 0, 0, 0)).expect("midnight");
        assert!(generated);
        let schedule = store.schedule().expect("read").expect("present");
        assert_eq!(local_date(schedule.generated_at), day());
        assert_eq!(local_date(schedule.scheduled_time), day() + Duration::days(1));

        // Ticks before the instant never fire.
        let before = schedule.scheduled_time - Duration::minutes(5);
        assert_eq!(
            dispatcher.minute_tick(before).await.expect("tick"),
            TickOutcome::Idle
        );

        // The tick inside the window fires once, to the one opted-in endpoint.
        let in_window = schedule.scheduled_time + Duration::seconds(10);
        assert_eq!(
            dispatcher.minute_tick(in_window).await.expect("tick"),
            TickOutcome::Fired(1)
        );

        // Eagerly re-armed for the following day.
        let rearmed = store.schedule().expect("read").expect("present");
        assert_eq!(
            local_date(rearmed.scheduled_time),
            local_date(in_window) + Duration::days(1)
        );

        // A duplicate tick in the same window is a no-op.
        let duplicate = schedule.scheduled_time + Duration::seconds(20);
        assert_eq!(
            dispatcher.minute_tick(duplicate).await.expect("tick"),
            TickOutcome::Idle
        );
    }

    #[tokio::test]
    async fn stale_record_regenerates_instead_of_firing() {
        let store = Store::open_in_memory().expect("store");
        subscribe(&store, "alice");
        let yesterday = day() - Duration::days(1);
        store
            .replace_schedule(DailySchedule {
                scheduled_time: at(yesterday, 10, 0, 0),
                generated_at: at(yesterday, 0, 0, 5),
            })
            .expect("seed");
        let sender = Arc::new(StubSender::delivering());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Notifier::new(store.clone(), Some(sender.clone())),
        );

        let outcome = dispatcher
            .minute_tick(at(day(), 12, 0, 0))
            .await
            .expect("tick");

        assert_eq!(outcome, TickOutcome::Generated);
        assert!(sender.sent_endpoints().is_empty());
        let schedule = store.schedule().expect("read").expect("present");
        assert_eq!(local_date(schedule.scheduled_time), day());
    }

    #[tokio::test]
    async fn missed_window_generated_today_waits_for_midnight() {
        let store = Store::open_in_memory().expect("store");
        store
            .replace_schedule(DailySchedule {
                scheduled_time: at(day(), 9, 0, 0),
                generated_at: at(day(), 0, 0, 5),
            })
            .expect("seed");
        let dispatcher = dispatcher_with(&store, StubSender::delivering());

        let outcome = dispatcher
            .minute_tick(at(day(), 10, 0, 0))
            .await
            .expect("tick");

        assert_eq!(outcome, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn fired_batch_reports_gone_and_prunes() {
        let store = Store::open_in_memory().expect("store");
        subscribe(&store, "alice");
        subscribe(&store, "bob");
        let sender = StubSender::delivering()
            .with_outcome("https://push.example/alice", SendOutcome::Gone);
        store
            .replace_schedule(DailySchedule {
                scheduled_time: at(day(), 14, 30, 0),
                generated_at: at(day() - Duration::days(1), 23, 0, 0),
            })
            .expect("seed");
        let dispatcher = dispatcher_with(&store, sender);

        let outcome = dispatcher
            .minute_tick(at(day(), 14, 30, 5))
            .await
            .expect("tick");

        assert_eq!(outcome, TickOutcome::Fired(1));
        assert!(store.subscription("alice").expect("read").is_none());
        assert!(store.subscription("bob").expect("read").is_some());
    }

    #[test]
    fn midnight_leaves_a_pending_schedule_untouched() {
        let store = Store::open_in_memory().expect("store");
        let pending = DailySchedule {
            scheduled_time: at(day(), 15, 0, 0),
            generated_at: at(day() - Duration::days(1), 18, 22, 0),
        };
        store.replace_schedule(pending).expect("seed");
        let dispatcher = dispatcher_with(&store, StubSender::delivering());

        let generated = dispatcher
            .midnight_tick(at(day(), 0, 0, 0))
            .expect("midnight");

        assert!(!generated);
        assert_eq!(store.schedule().expect("read").expect("present"), pending);
    }

    #[test]
    fn midnight_replaces_a_lapsed_stale_schedule() {
        let store = Store::open_in_memory().expect("store");
        let two_days_ago = day() - Duration::days(2);
        store
            .replace_schedule(DailySchedule {
                scheduled_time: at(two_days_ago, 15, 0, 0),
                generated_at: at(two_days_ago, 0, 0, 5),
            })
            .expect("seed");
        let dispatcher = dispatcher_with(&store, StubSender::delivering());

        let generated = dispatcher
            .midnight_tick(at(day(), 0, 0, 0))
            .expect("midnight");

        assert!(generated);
        let schedule = store.schedule().expect("read").expect("present");
        assert_eq!(local_date(schedule.scheduled_time), day() + Duration::days(1));
    }
}
