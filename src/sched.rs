use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::BlockCheck;

/// Spawns the periodic check loop. Returns the sender used to force an
/// immediate check (the manual trigger resets the timer so a scheduled run
/// does not fire right behind it). The first check runs at startup.
pub fn spawn(engine: Arc<BlockCheck>, interval: Duration) -> mpsc::Sender<()> {
    let (tx, mut rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("scheduled block check");
                }
                Some(()) = rx.recv() => {
                    info!("manual block check triggered");
                    ticker.reset();
                }
            }

            let outcome = engine.run().await;
            debug!("block check finished: {:?}", outcome);
        }
    });

    tx
}
