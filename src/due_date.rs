//! Decides whether a renewal, or one of its orders, is due to run.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    certificate::CertificateInfo,
    model::{OrderContext, Renewal},
    settings::ScheduleSettings,
    types::RenewalWindow,
};

pub trait DueDatePolicy: Send + Sync {
    /// Cheap check before any target is generated.
    fn should_run_renewal(&self, renewal: &Renewal, now: DateTime<Utc>) -> bool;

    fn should_run_order(&self, renewal: &Renewal, context: &OrderContext, now: DateTime<Utc>)
        -> bool;

    /// Whether the caller should fetch the CA suggested window for previous certificates.
    fn wants_renewal_info(&self) -> bool {
        false
    }
}

/// Picks the policy the schedule settings ask for.
pub fn from_settings(settings: &ScheduleSettings) -> Box<dyn DueDatePolicy> {
    if !settings.renewal_disable_server_schedule {
        Box::new(ServerDrivenDueDate::new(settings.clone()))
    } else if settings.renewal_days_range > 0 {
        Box::new(RandomDueDate::new(settings.clone()))
    } else {
        Box::new(StaticDueDate::new(settings.clone()))
    }
}

fn latest_due_date(
    settings: &ScheduleSettings,
    anchor: DateTime<Utc>,
    expiry: DateTime<Utc>,
) -> DateTime<Utc> {
    let by_age = anchor + Duration::days(settings.renewal_days);
    let by_expiry = expiry - Duration::days(settings.renewal_minimum_valid_days);
    by_age.min(by_expiry)
}

/// The issue date that counts for the certificate: its first successful run, else its own start.
fn anchor_of(renewal: &Renewal, certificate: &CertificateInfo) -> DateTime<Utc> {
    renewal
        .first_success_with(&certificate.thumbprint)
        .unwrap_or(certificate.not_before)
}

/// Draws with probability `1 / days_left` until the deadline is one day away.
struct Lottery {
    rng: Mutex<StdRng>,
}

impl Lottery {
    fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    fn draw(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let days_left = (deadline - now).num_seconds() as f64 / 86_400.0;
        if days_left <= 1.0 {
            return true;
        }
        let roll: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen(),
            Err(poisoned) => poisoned.into_inner().gen(),
        };
        roll < 1.0 / days_left
    }

    fn draw_in_window(&self, window: &RenewalWindow, now: DateTime<Utc>) -> bool {
        if now < window.start {
            return false;
        }
        self.draw(window.end, now)
    }
}

/// Due a fixed number of days after issuance, or a minimum before expiry.
pub struct StaticDueDate {
    settings: ScheduleSettings,
}

impl StaticDueDate {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self { settings }
    }
}

impl DueDatePolicy for StaticDueDate {
    fn should_run_renewal(&self, renewal: &Renewal, now: DateTime<Utc>) -> bool {
        let last = match renewal.last_success() {
            Some(last) => last,
            None => return true,
        };
        let expiry = last
            .order_results
            .iter()
            .filter_map(|order| order.expire_date)
            .min();
        let anchor = last
            .order_results
            .iter()
            .filter_map(|order| order.thumbprint.as_deref())
            .filter_map(|thumbprint| renewal.first_success_with(thumbprint))
            .min()
            .unwrap_or(last.date);
        let due = match expiry {
            Some(expiry) => latest_due_date(&self.settings, anchor, expiry),
            None => anchor + Duration::days(self.settings.renewal_days),
        };
        debug!("Renewal {} due at {}", renewal.id, due);
        now >= due
    }

    fn should_run_order(
        &self,
        renewal: &Renewal,
        context: &OrderContext,
        now: DateTime<Utc>,
    ) -> bool {
        match &context.previous_certificate {
            Some(previous) => {
                let due = latest_due_date(&self.settings, anchor_of(renewal, previous), previous.not_after);
                debug!("Order {} due at {}", context.order.friendly_name, due);
                now >= due
            }
            None => true,
        }
    }
}

/// Spreads renewals over a window before the static due date.
pub struct RandomDueDate {
    settings: ScheduleSettings,
    lottery: Lottery,
}

impl RandomDueDate {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self {
            settings,
            lottery: Lottery::new(None),
        }
    }

    pub fn with_seed(settings: ScheduleSettings, seed: u64) -> Self {
        Self {
            settings,
            lottery: Lottery::new(Some(seed)),
        }
    }
}

impl DueDatePolicy for RandomDueDate {
    fn should_run_renewal(&self, _renewal: &Renewal, _now: DateTime<Utc>) -> bool {
        true
    }

    fn should_run_order(
        &self,
        renewal: &Renewal,
        context: &OrderContext,
        now: DateTime<Utc>,
    ) -> bool {
        let previous = match &context.previous_certificate {
            Some(previous) => previous,
            // new source, nothing to compare against
            None => return true,
        };
        let latest = latest_due_date(&self.settings, anchor_of(renewal, previous), previous.not_after);
        let earliest = latest - Duration::days(self.settings.renewal_days_range);
        if now < earliest {
            debug!("Order {} not due before {}", context.order.friendly_name, earliest);
            return false;
        }
        self.lottery.draw(latest, now)
    }
}

/// Follows the CA suggested renewal window when there is one.
pub struct ServerDrivenDueDate {
    settings: ScheduleSettings,
    lottery: Lottery,
}

impl ServerDrivenDueDate {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self {
            settings,
            lottery: Lottery::new(None),
        }
    }

    pub fn with_seed(settings: ScheduleSettings, seed: u64) -> Self {
        Self {
            settings,
            lottery: Lottery::new(Some(seed)),
        }
    }
}

impl DueDatePolicy for ServerDrivenDueDate {
    fn should_run_renewal(&self, _renewal: &Renewal, _now: DateTime<Utc>) -> bool {
        true
    }

    fn should_run_order(
        &self,
        renewal: &Renewal,
        context: &OrderContext,
        now: DateTime<Utc>,
    ) -> bool {
        if let (Some(window), false) = (
            &context.renewal_window,
            self.settings.renewal_disable_server_schedule,
        ) {
            debug!(
                "Order {} uses the server window {} - {}",
                context.order.friendly_name, window.start, window.end
            );
            return self.lottery.draw_in_window(window, now);
        }

        let previous = match &context.previous_certificate {
            Some(previous) => previous,
            None => return true,
        };
        // validity dates only count for certificates this renewal did issue
        let anchor = match renewal.first_success_with(&previous.thumbprint) {
            Some(anchor) => anchor,
            None => return true,
        };
        let latest = latest_due_date(&self.settings, anchor, previous.not_after);
        let earliest = latest - Duration::days(self.settings.renewal_days_range);
        if now < earliest {
            return false;
        }
        self.lottery.draw(latest, now)
    }

    fn wants_renewal_info(&self) -> bool {
        !self.settings.renewal_disable_server_schedule
    }
}
