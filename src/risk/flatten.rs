//! End-of-day flatten scheduler (spec §4.4, §9 Open Question c).
//! Calendar math runs in the configured IANA timezone, never UTC, and the
//! "fired today" predicate is idempotent per local calendar day.

use crate::broker::session::BrokerSession;
use crate::events::model::{EventPayload, SessionFlattenedPayload};
use crate::events::EventStore;
use crate::readmodel::ReadModels;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct FlattenScheduler {
    trigger_time: NaiveTime,
    timezone: Tz,
    fired_on: Mutex<Option<NaiveDate>>,
    models: Arc<ReadModels>,
    store: Arc<EventStore>,
    broker: Arc<BrokerSession>,
}

impl FlattenScheduler {
    pub fn new(
        hhmm: &str,
        timezone: Tz,
        models: Arc<ReadModels>,
        store: Arc<EventStore>,
        broker: Arc<BrokerSession>,
    ) -> anyhow::Result<Self> {
        let trigger_time = NaiveTime::parse_from_str(hhmm, "%H:%M")
            .map_err(|e| anyhow::anyhow!("invalid flatten time {hhmm}: {e}"))?;
        Ok(Self {
            trigger_time,
            timezone,
            fired_on: Mutex::new(None),
            models,
            store,
            broker,
        })
    }

    /// Call periodically (e.g. every 30s from a background task). Idempotent
    /// per local calendar day: re-invoking after firing is a no-op until the
    /// local date advances past the fired date.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let local_now = Utc::now().with_timezone(&self.timezone);
        let today = local_now.date_naive();

        if local_now.time() < self.trigger_time {
            return Ok(());
        }
        {
            let mut fired_on = self.fired_on.lock();
            if *fired_on == Some(today) {
                return Ok(());
            }
            *fired_on = Some(today);
        }

        self.fire().await
    }

    async fn fire(&self) -> anyhow::Result<()> {
        let open_symbols: Vec<String> = self
            .models
            .positions
            .read()
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| p.symbol.clone())
            .collect();

        let mut closed_order_ids = Vec::new();
        for symbol in &open_symbols {
            let order_id = self.broker.submit_market_close(symbol).await?;
            closed_order_ids.push(order_id);
        }

        let cancelled_order_ids = self.broker.cancel_all_open_orders().await?;

        self.store
            .append(EventPayload::SessionFlattened(SessionFlattenedPayload {
                closed_order_ids,
                cancelled_order_ids,
            }))
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn fired_on(&self) -> Option<NaiveDate> {
        *self.fired_on.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn idempotent_within_same_day() {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(EventStore::new(db.clone()).unwrap());
        let limits = crate::readmodel::session_state::SessionLimits {
            max_position_pct: 0.1,
            max_daily_loss_pct: 0.02,
            max_concentration_pct: 0.25,
            volatility_scalar: 1.0,
            max_daily_trades: 50,
            consecutive_loss_limit: 5,
        };
        let models = Arc::new(ReadModels::new(100_000.0, limits, db));
        let broker = Arc::new(BrokerSession::new_disconnected());

        let scheduler = FlattenScheduler::new(
            "00:00",
            chrono_tz::UTC,
            models,
            store.clone(),
            broker,
        )
        .unwrap();

        scheduler.tick().await.unwrap();
        let first_fired = scheduler.fired_on();
        assert!(first_fired.is_some());

        scheduler.tick().await.unwrap();
        assert_eq!(scheduler.fired_on(), first_fired);

        // Exactly one SessionFlattened event should have been appended.
        let events = store.replay(0).unwrap();
        let flattened_count = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::SessionFlattened(_)))
            .count();
        assert_eq!(flattened_count, 1);
    }
}
