use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use ridepool_booking::ExpiryReconciler;

/// Start the expiry sweep as a background task owned by the process.
pub fn spawn_reconciler(
    reconciler: Arc<ExpiryReconciler>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!("Scheduling expiry reconciler every {:?}", interval);
    tokio::spawn(reconciler.run(interval, shutdown))
}
