//! Request-reply plumbing for agent messages.
//!
//! Agent messages must be `Clone`, so the one-shot reply sender is shared
//! behind a mutex and taken by whichever handler answers first.

use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Shared slot holding the reply sender until an agent answers.
pub type ResponseChannel<T> = Arc<Mutex<Option<oneshot::Sender<T>>>>;

/// Pair a fresh reply slot with the receiver the caller awaits.
#[must_use]
pub fn create_request_reply<T>() -> (ResponseChannel<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Answer a request, consuming the slot's sender.
///
/// # Errors
///
/// Hands `value` back when the slot is empty or the caller stopped waiting.
pub async fn send_response<T>(response_tx: ResponseChannel<T>, value: T) -> Result<(), T> {
    let sender = response_tx.lock().await.take();
    let Some(sender) = sender else {
        return Err(value);
    };
    sender.send(value)
}

/// Answer a request that may not want a reply; failures are ignored.
pub async fn send_optional_response<T>(response_tx: Option<ResponseChannel<T>>, value: T) {
    if let Some(tx) = response_tx {
        let _ = send_response(tx, value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_is_delivered_once() {
        let (tx, rx) = create_request_reply::<u32>();
        assert!(send_response(tx.clone(), 7).await.is_ok());
        assert_eq!(rx.await.unwrap(), 7);
        assert_eq!(send_response(tx, 8).await, Err(8));
    }

    #[tokio::test]
    async fn test_response_returned_when_caller_gave_up() {
        let (tx, rx) = create_request_reply::<&str>();
        drop(rx);
        assert_eq!(send_response(tx, "late").await, Err("late"));
    }

    #[tokio::test]
    async fn test_optional_response_without_channel() {
        send_optional_response::<u32>(None, 1).await;
    }
}
