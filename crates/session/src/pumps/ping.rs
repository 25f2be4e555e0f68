//! Keepalive pings on an otherwise idle gateway link.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Queues a ping every `period` until cancelled or the writer goes away.
///
/// The first ping goes out one full period after the link opens and late
/// ticks are not bunched up. Pong tracking belongs to the read pump.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                if write_tx.send(tungstenite::Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                sent += 1;
                trace!(sent, "keepalive ping queued");
            }
        }
    }
    debug!(sent, "keepalive stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pings_follow_the_configured_period() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(5), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err(), "no ping before the first period");

        tokio::time::sleep(Duration::from_secs(8)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut pings = 0;
        while let Ok(msg) = rx.try_recv() {
            assert!(matches!(msg, tungstenite::Message::Ping(_)));
            pings += 1;
        }
        assert_eq!(pings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(1), CancellationToken::new()));
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pump exits")
            .unwrap();
    }
}
