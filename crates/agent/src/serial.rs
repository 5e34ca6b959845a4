//! The per-session serialization queue.
//!
//! Every state mutation and every store call that depends on state runs
//! through [`SerialCell::run`]: the block receives the current
//! `SessionState` by copy, may await store I/O, and its mutations are
//! committed only when it returns `Ok`. One block runs at a time, so
//! in-memory state and the store move together, and committed events
//! emitted inside a block are observed in store-write order.
//!
//! Blocks must not submit nested blocks (the inner one would wait on
//! the lock the outer one holds). Awaiting an LLM stream or a tool
//! execution inside a block is forbidden; both run off-queue.

use std::future::Future;

use tokio::sync::Mutex;

use helm_domain::error::Result;

use crate::state::SessionState;

pub(crate) struct SerialCell {
    state: Mutex<SessionState>,
}

impl SerialCell {
    pub fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Replace the committed state wholesale (initial load, post-compaction
    /// refresh).
    pub async fn replace(&self, state: SessionState) {
        *self.state.lock().await = state;
    }

    /// Run one serialized block. The block's copy is committed on `Ok`
    /// and discarded on `Err`.
    pub async fn run<T, F, Fut>(&self, block: F) -> Result<T>
    where
        F: FnOnce(SessionState) -> Fut,
        Fut: Future<Output = Result<(SessionState, T)>>,
    {
        let mut guard = self.state.lock().await;
        let (next, out) = block(guard.clone()).await?;
        *guard = next;
        Ok(out)
    }

    /// Read the committed state under the serialization lock.
    pub async fn with_lock<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
        let guard = self.state.lock().await;
        f(&guard)
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_domain::error::Error;
    use helm_domain::queue::QueueItem;

    #[tokio::test]
    async fn ok_blocks_commit() {
        let cell = SerialCell::new(SessionState::default());
        cell.run(|mut st| async move {
            st.steer_queue.push(QueueItem::text("x"));
            Ok((st, ()))
        })
        .await
        .unwrap();
        assert_eq!(cell.snapshot().await.steer_queue.len(), 1);
    }

    #[tokio::test]
    async fn err_blocks_discard_mutations() {
        let cell = SerialCell::new(SessionState::default());
        let result: Result<()> = cell
            .run(|mut st| async move {
                st.steer_queue.push(QueueItem::text("x"));
                Err::<(SessionState, ()), _>(Error::Store("write failed".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(cell.snapshot().await.steer_queue.is_empty());
    }

    #[tokio::test]
    async fn blocks_are_serialized() {
        use std::sync::Arc;

        let cell = Arc::new(SerialCell::new(SessionState::default()));
        let mut handles = Vec::new();
        for i in 0..16 {
            let cell = cell.clone();
            handles.push(tokio::spawn(async move {
                cell.run(|mut st| async move {
                    // Read-modify-write across an await; serialization
                    // makes this race-free.
                    let len = st.follow_up_queue.len();
                    tokio::task::yield_now().await;
                    st.follow_up_queue.push(QueueItem::text(format!("{i}:{len}")));
                    Ok((st, ()))
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let state = cell.snapshot().await;
        assert_eq!(state.follow_up_queue.len(), 16);
        // Every block saw the length its predecessor left behind.
        for (expected, item) in state.follow_up_queue.iter().enumerate() {
            let text = match &item.payload[0] {
                helm_domain::message::ContentBlock::Text { text, .. } => text,
                other => panic!("unexpected payload {other:?}"),
            };
            let seen: usize = text.split(':').nth(1).unwrap().parse().unwrap();
            assert_eq!(seen, expected);
        }
    }
}
