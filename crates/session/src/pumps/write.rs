//! WebSocket write pump. Serialises outbound frames.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Writes frames to the WebSocket until cancelled or the channel closes.
///
/// A close frame queued before cancellation is flushed first, so
/// [`GatewayLink::close`](crate::gateway::GatewayLink) reaches the gateway.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = write_rx.recv() => {
                match msg {
                    Some(tungstenite::Message::Close(frame)) => {
                        let _ = write.send(tungstenite::Message::Close(frame)).await;
                        return;
                    }
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
