use crate::cache::{CacheEvent, WaiterId};
use crate::error::AssetResult;
use crossbeam_channel::{Receiver, Sender};
use emblem_base::{AssetKey, ResourceHandle};

//
// A LoadTicket is the waiter side of a request. It resolves at most once, during a cache
// update(), so the owner polls it with try_take rather than blocking on it. Dropping an
// unresolved ticket detaches the waiter; when the last waiter of a load detaches the
// cache cancels the underlying fetch.
//

struct TicketDetach<T> {
    key: AssetKey,
    waiter_id: WaiterId,
    events_tx: Sender<CacheEvent<T>>,
}

pub struct LoadTicket<T> {
    result_rx: Receiver<AssetResult<ResourceHandle<T>>>,
    // taken once the result is consumed so drop stops meaning "detach"
    detach: Option<TicketDetach<T>>,
}

impl<T> LoadTicket<T> {
    /// A ticket that already holds its outcome (cache hits resolve synchronously).
    pub(crate) fn resolved(result: AssetResult<ResourceHandle<T>>) -> Self {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        result_tx.send(result).unwrap();
        LoadTicket {
            result_rx,
            detach: None,
        }
    }

    /// A ticket wired to a waiter slot on a queued or in-flight load. The cache keeps
    /// the sender and resolves it from update().
    pub(crate) fn pending(
        key: AssetKey,
        waiter_id: WaiterId,
        events_tx: Sender<CacheEvent<T>>,
    ) -> (Sender<AssetResult<ResourceHandle<T>>>, Self) {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let ticket = LoadTicket {
            result_rx,
            detach: Some(TicketDetach {
                key,
                waiter_id,
                events_tx,
            }),
        };
        (result_tx, ticket)
    }

    /// Poll for the outcome. None until the load resolves (and again after the result
    /// has been taken). The first Some hands over the acquired resource handle.
    pub fn try_take(&mut self) -> Option<AssetResult<ResourceHandle<T>>> {
        match self.result_rx.try_recv() {
            Ok(result) => {
                self.detach = None;
                Some(result)
            }
            Err(_) => None,
        }
    }
}

impl<T> Drop for LoadTicket<T> {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            let _ = detach.events_tx.send(CacheEvent::Detach {
                key: detach.key,
                waiter_id: detach.waiter_id,
            });
        }
    }
}
