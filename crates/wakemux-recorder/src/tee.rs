use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fan `source` out to two bounded queues.
///
/// Every item goes to the first queue, then the second, before the next item
/// is read. The producer stops when `cancel` fires, the source ends, or either
/// consumer goes away; it owns `source`, so the source closes when it stops.
pub fn tee<T>(
    mut source: mpsc::Receiver<T>,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<T>, mpsc::Receiver<T>, JoinHandle<()>)
where
    T: Clone + Send + 'static,
{
    let (first_tx, first_rx) = mpsc::channel(capacity.max(1));
    let (second_tx, second_rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut forwarded = 0u64;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = source.recv() => item,
            };
            let Some(item) = item else {
                debug!("tee source ended");
                break;
            };
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivered = forward(&first_tx, &second_tx, item) => delivered,
            };
            if !delivered {
                warn!(forwarded, "tee consumer went away; stopping fan-out");
                break;
            }
            forwarded += 1;
        }
        debug!(forwarded, "tee stopped");
    });

    (first_rx, second_rx, handle)
}

async fn forward<T: Clone>(first: &mpsc::Sender<T>, second: &mpsc::Sender<T>, item: T) -> bool {
    first.send(item.clone()).await.is_ok() && second.send(item).await.is_ok()
}
