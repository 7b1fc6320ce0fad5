use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use super::broadcast::MetricsBroadcaster;

/// Pushes every new metrics snapshot to one client until either side goes away.
pub async fn handle_metrics_socket(socket: WebSocket, broadcaster: Arc<MetricsBroadcaster>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subscription = broadcaster.subscribe();
    let id = subscription.id;

    loop {
        tokio::select! {
            message = subscription.receiver.recv() => {
                match message {
                    Some(json) => {
                        if ws_tx.send(Message::Text(json.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    // Dropped by the broadcaster for falling behind.
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    broadcaster.unsubscribe(id);
    tracing::debug!(subscriber = id, "metrics socket closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::{State, WebSocketUpgrade};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use tokio_tungstenite::tungstenite;

    use super::*;

    async fn upgrade(
        ws: WebSocketUpgrade,
        State(broadcaster): State<Arc<MetricsBroadcaster>>,
    ) -> Response {
        ws.on_upgrade(move |socket| handle_metrics_socket(socket, broadcaster))
    }

    async fn wait_for_subscribers(broadcaster: &MetricsBroadcaster, count: usize) -> bool {
        for _ in 0..200 {
            if broadcaster.subscriber_count() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn socket_relays_broadcasts_and_unsubscribes_on_close() {
        let broadcaster = Arc::new(MetricsBroadcaster::new(8));
        let app = Router::new()
            .route("/ws", get(upgrade))
            .with_state(Arc::clone(&broadcaster));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        assert!(wait_for_subscribers(&broadcaster, 1).await);

        for frame in 1..=3 {
            broadcaster.broadcast(Arc::from(format!("{{\"frame\":{frame}}}")));
        }
        for frame in 1..=3 {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match message {
                tungstenite::Message::Text(text) => {
                    assert_eq!(text.as_str(), format!("{{\"frame\":{frame}}}"))
                }
                other => panic!("unexpected message {other:?}"),
            }
        }

        client.close(None).await.unwrap();
        assert!(wait_for_subscribers(&broadcaster, 0).await);
        server.abort();
    }
}
