//! Delivery worker pool.
//!
//! N tasks poll the durable queue; each claim gives one worker exclusive
//! processing for the visibility window. Workers coordinate only through the
//! queue's claim UPDATE and the lead's guarded transitions.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::delivery::executor::{process_job, DeliverySettings, WebhookTransport};
use crate::models::Config;
use crate::store::{now_ms, Db};

pub fn spawn_delivery_workers(db: Db, config: Arc<Config>, transport: Arc<dyn WebhookTransport>) {
    let settings = DeliverySettings {
        max_attempts: config.webhook_max_attempts,
        backoff_secs: config.webhook_backoff_secs.clone(),
    };
    let visibility_ms = (config.queue_visibility_timeout_secs * 1000) as i64;
    let poll_interval = Duration::from_millis(config.queue_poll_interval_ms);

    info!(
        workers = config.delivery_workers,
        visibility_ms, "starting delivery workers"
    );

    for worker_id in 0..config.delivery_workers {
        let db = db.clone();
        let transport = transport.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            loop {
                let claimed = match db.claim_delivery(now_ms(), visibility_ms) {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        error!(worker_id, error = %e, "queue claim failed");
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };

                match claimed {
                    Some(job) => {
                        if let Err(e) =
                            process_job(&db, transport.as_ref(), &settings, &job, now_ms()).await
                        {
                            // The claim expires on its own; the job resurfaces.
                            error!(
                                worker_id,
                                lead_id = job.lead_id,
                                error = %e,
                                "delivery processing failed; leaving job to visibility timeout"
                            );
                        }
                    }
                    None => tokio::time::sleep(poll_interval).await,
                }
            }
        });
    }
}
