//! Multi-peer query engine: races one request across eligible peers, one
//! peer at a time, until a response satisfies the caller.

use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::sync::{mpsc, watch};

use crate::peer::{PeerHandle, SpMsg};
use crate::wire::Message;

const LOG_TARGET: &str = "query";

const QUERY_CHANNEL_CAPACITY: usize = 64;

/// Per-query overrides of the global defaults.
#[derive(Clone, Copy, Debug)]
pub struct QueryOptions {
    /// How long one peer gets to answer before the query rotates onward.
    pub timeout: Duration,
}

/// Cooperative cancellation handle given to the response callback; closing
/// it ends the query.
#[derive(Clone)]
pub struct Quit {
    tx: Arc<watch::Sender<bool>>,
}

impl Quit {
    pub fn close(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Sends `message` to each selected peer in turn, subscribing to that
/// peer's fan-out while it holds the baton. Every inbound message observed
/// during the query is handed to `check_response`, which closes the quit
/// handle once the sought answer arrives. When all peers time out, the
/// engine closes the quit handle itself and returns.
pub async fn query_peers<F>(
    peers: Vec<PeerHandle>,
    select: impl Fn(&PeerHandle) -> bool,
    message: Message,
    check_response: F,
    options: QueryOptions,
) where
    F: FnMut(&PeerHandle, &Message, &Quit) + Send + 'static,
{
    let (quit_tx, mut quit_rx) = watch::channel(false);
    let quit = Quit {
        tx: Arc::new(quit_tx),
    };
    let (msg_tx, msg_rx) = mpsc::channel::<SpMsg>(QUERY_CHANNEL_CAPACITY);

    let collector = tokio::spawn(collect_responses(msg_rx, check_response, quit.clone()));

    for peer in peers.into_iter().filter(|peer| select(peer)) {
        if quit.is_closed() {
            break;
        }
        let subscription = peer.subscribe(msg_tx.clone());
        if !peer.queue_message(message.clone()) {
            peer.unsubscribe(subscription);
            continue;
        }
        trace!(target: LOG_TARGET, "querying {peer} with {}", message.command());
        tokio::select! {
            _ = tokio::time::sleep(options.timeout) => {}
            _ = quit_rx.changed() => {}
        }
        peer.unsubscribe(subscription);
        if quit.is_closed() {
            break;
        }
    }

    // Nothing answered, or the caller is satisfied; either way the
    // collector must wind down.
    quit.close();
    drop(msg_tx);
    let _ = collector.await;
}

async fn collect_responses<F>(mut msg_rx: mpsc::Receiver<SpMsg>, mut check_response: F, quit: Quit)
where
    F: FnMut(&PeerHandle, &Message, &Quit) + Send + 'static,
{
    let mut quit_rx = quit.tx.subscribe();
    loop {
        tokio::select! {
            changed = quit_rx.changed() => {
                if changed.is_err() || *quit_rx.borrow() {
                    break;
                }
            }
            received = msg_rx.recv() => {
                let Some(sp_msg) = received else { break };
                check_response(&sp_msg.peer, &sp_msg.message, &quit);
            }
        }
    }
}
