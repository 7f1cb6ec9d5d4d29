use crate::cache::{CacheEvent, FetchResult, LoadId};
use crate::error::{AssetError, AssetResult};
use crossbeam_channel::{Receiver, Sender};
use emblem_base::{AssetKey, LoadedAsset};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Cooperative cancellation flag for one in-flight fetch. The cache sets it when the
/// last waiter detaches; the io implementation observes it best-effort. A fetch that
/// cannot cancel simply completes and its result is discarded.
#[derive(Clone, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

// Represents a source we can fetch and decode assets from
pub trait AssetIo<T>: Send + Sync {
    /// Open a byte stream for the key. Runs on a fetch worker thread and may block.
    fn fetch(
        &self,
        key: &AssetKey,
        cancel: &CancelToken,
    ) -> AssetResult<Box<dyn Read + Send>>;

    /// Decode the fetched bytes into an asset plus its lifecycle hooks.
    fn decode(
        &self,
        key: &AssetKey,
        stream: Box<dyn Read + Send>,
    ) -> AssetResult<LoadedAsset<T>>;
}

pub(crate) struct FetchRequest {
    pub key: AssetKey,
    pub load_id: LoadId,
    pub cancel: CancelToken,
}

// Thread that tries to take jobs out of the request channel and ends when the finish
// channel is signalled
struct FetchWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl FetchWorkerThread {
    fn new<T: Send + 'static>(
        io: Arc<dyn AssetIo<T>>,
        request_rx: Receiver<FetchRequest>,
        result_tx: Sender<CacheEvent<T>>,
        thread_index: usize,
    ) -> Self {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("Fetch Thread".into())
            .spawn(move || {
                profiling::register_thread!(&format!("FetchWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let request = msg.unwrap();
                            profiling::scope!("fetch_asset");
                            log::trace!("start fetch {:?} {:?}", request.key, request.load_id);

                            let result = if request.cancel.is_cancelled() {
                                // Cancelled while still sitting in the request channel
                                Err(AssetError::LoadCancelled)
                            } else {
                                io.fetch(&request.key, &request.cancel).and_then(|stream| {
                                    profiling::scope!("decode_asset");
                                    io.decode(&request.key, stream)
                                })
                            };

                            log::trace!("finish fetch {:?} {:?} ok={}", request.key, request.load_id, result.is_ok());
                            result_tx.send(CacheEvent::LoadResult(FetchResult {
                                key: request.key,
                                load_id: request.load_id,
                                result,
                            })).unwrap();
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        FetchWorkerThread {
            finish_tx,
            join_handle,
        }
    }
}

// Spawns N threads, proxies fetch jobs to them, and kills the threads when finished.
// Admission control (max concurrency) is the cache's job, the pool is pure transport.
pub(crate) struct FetchThreadPool {
    worker_threads: Vec<FetchWorkerThread>,
    request_tx: Sender<FetchRequest>,
}

impl FetchThreadPool {
    pub fn new<T: Send + 'static>(
        io: Arc<dyn AssetIo<T>>,
        worker_thread_count: usize,
        result_tx: Sender<CacheEvent<T>>,
    ) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<FetchRequest>();

        let mut worker_threads = Vec::with_capacity(worker_thread_count);
        for thread_index in 0..worker_thread_count {
            let worker = FetchWorkerThread::new(
                io.clone(),
                request_rx.clone(),
                result_tx.clone(),
                thread_index,
            );
            worker_threads.push(worker);
        }

        FetchThreadPool {
            worker_threads,
            request_tx,
        }
    }

    pub fn add_request(
        &self,
        request: FetchRequest,
    ) {
        self.request_tx.send(request).unwrap();
    }

    pub fn finish(self) {
        for worker_thread in &self.worker_threads {
            worker_thread.finish_tx.send(()).unwrap();
        }

        for worker_thread in self.worker_threads {
            worker_thread.join_handle.join().unwrap();
        }
    }
}
