use log::{error, info};

use crate::model::{Renewal, RenewResult};

/// Receives the outcome of every renewal run that did something.
pub trait Notifier: Send + Sync {
    fn notify_success(&self, renewal: &Renewal, result: &RenewResult);

    fn notify_failure(&self, renewal: &Renewal, result: &RenewResult);
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_success(&self, renewal: &Renewal, result: &RenewResult) {
        let thumbprints: Vec<&str> = result
            .order_results
            .iter()
            .filter_map(|order| order.thumbprint.as_deref())
            .collect();
        info!(
            "Renewal {} succeeded: {}",
            renewal.display_name(),
            thumbprints.join(", ")
        );
    }

    fn notify_failure(&self, renewal: &Renewal, result: &RenewResult) {
        error!("Renewal {} failed", renewal.display_name());
        for message in result.all_errors() {
            error!("- {}", message);
        }
    }
}
