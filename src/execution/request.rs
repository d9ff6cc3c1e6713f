//! Asynchronous tile requests and their listeners.
//!
//! A [`TileRequest`] is the handle returned by an asynchronous scheduling
//! call. It tracks the status of every requested tile, can be waited on, and
//! is passed back to each [`TileComputationListener`] callback so listeners
//! can tell requests apart.

use crate::core::error::{ImageId, RequestId, TileError};
use crate::core::geometry::TileIndex;
use crate::core::raster::Raster;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Status of one tile of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileStatus {
    /// Queued, not started.
    Pending,
    /// Being computed.
    Processing,
    /// Computed and delivered to listeners.
    Computed,
    /// Cancelled before computation started.
    Cancelled,
    /// Computation failed; the failure was delivered to listeners.
    Failed,
}

impl TileStatus {
    /// Whether the tile will not change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TileStatus::Computed | TileStatus::Cancelled | TileStatus::Failed
        )
    }
}

/// Receives the outcome of asynchronously computed tiles.
///
/// Callbacks run on scheduler worker threads.
pub trait TileComputationListener: Send + Sync {
    /// A tile was computed.
    fn tile_computed(&self, request: &TileRequest, image: ImageId, index: TileIndex, tile: &Raster);

    /// A tile was cancelled before it was computed.
    fn tile_cancelled(&self, _request: &TileRequest, _image: ImageId, _index: TileIndex) {}

    /// Computing a tile failed.
    fn tile_computation_failure(&self, request: &TileRequest, image: ImageId, index: TileIndex, error: &TileError);
}

/// A shared listener.
pub type SharedTileListener = Arc<dyn TileComputationListener>;

/// A tile outcome, as delivered to closure listeners.
#[derive(Debug, Clone)]
pub enum TileEvent {
    /// A tile was computed.
    Computed {
        request: RequestId,
        image: ImageId,
        index: TileIndex,
        tile: Raster,
    },
    /// A tile was cancelled.
    Cancelled {
        request: RequestId,
        image: ImageId,
        index: TileIndex,
    },
    /// A tile failed.
    Failed {
        request: RequestId,
        image: ImageId,
        index: TileIndex,
        error: TileError,
    },
}

/// Callback type for tile events.
pub type TileEventCallback = Box<dyn Fn(TileEvent) + Send + Sync>;

/// Adapts a closure to [`TileComputationListener`].
pub struct CallbackListener {
    callback: TileEventCallback,
}

impl CallbackListener {
    /// Wrap a callback.
    pub fn new(callback: impl Fn(TileEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Wrap a callback into a shared listener.
    pub fn shared(callback: impl Fn(TileEvent) + Send + Sync + 'static) -> SharedTileListener {
        Arc::new(Self::new(callback))
    }
}

impl TileComputationListener for CallbackListener {
    fn tile_computed(&self, request: &TileRequest, image: ImageId, index: TileIndex, tile: &Raster) {
        (self.callback)(TileEvent::Computed {
            request: request.id(),
            image,
            index,
            tile: tile.clone(),
        });
    }

    fn tile_cancelled(&self, request: &TileRequest, image: ImageId, index: TileIndex) {
        (self.callback)(TileEvent::Cancelled {
            request: request.id(),
            image,
            index,
        });
    }

    fn tile_computation_failure(&self, request: &TileRequest, image: ImageId, index: TileIndex, error: &TileError) {
        (self.callback)(TileEvent::Failed {
            request: request.id(),
            image,
            index,
            error: error.clone(),
        });
    }
}

struct RequestInner {
    id: RequestId,
    image: ImageId,
    indices: Vec<TileIndex>,
    listeners: Vec<SharedTileListener>,
    status: Mutex<IndexMap<TileIndex, TileStatus>>,
    finished: Condvar,
}

/// Handle to one asynchronous batch of tiles. Clones share state.
#[derive(Clone)]
pub struct TileRequest {
    inner: Arc<RequestInner>,
}

impl TileRequest {
    /// Create a request with every tile pending.
    pub fn new(image: ImageId, indices: Vec<TileIndex>, listeners: Vec<SharedTileListener>) -> Self {
        let status = indices.iter().map(|&i| (i, TileStatus::Pending)).collect();
        Self {
            inner: Arc::new(RequestInner {
                id: RequestId::new(),
                image,
                indices,
                listeners,
                status: Mutex::new(status),
                finished: Condvar::new(),
            }),
        }
    }

    /// Identity of the request.
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Image whose tiles were requested.
    pub fn image(&self) -> ImageId {
        self.inner.image
    }

    /// Requested tiles, in request order (duplicates preserved).
    pub fn tile_indices(&self) -> &[TileIndex] {
        &self.inner.indices
    }

    /// Distinct requested tiles, in first-seen order.
    pub fn unique_indices(&self) -> Vec<TileIndex> {
        self.inner.status.lock().keys().copied().collect()
    }

    /// Listeners notified for this request.
    pub fn listeners(&self) -> &[SharedTileListener] {
        &self.inner.listeners
    }

    /// Status of a tile, or `None` if it is not part of the request.
    pub fn tile_status(&self, index: TileIndex) -> Option<TileStatus> {
        self.inner.status.lock().get(&index).copied()
    }

    /// Whether every tile reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.inner.status.lock().values().all(TileStatus::is_terminal)
    }

    /// Block until every tile reached a terminal status.
    pub fn wait(&self) {
        let mut status = self.inner.status.lock();
        while !status.values().all(TileStatus::is_terminal) {
            self.inner.finished.wait(&mut status);
        }
    }

    /// Block until done or until `timeout` elapses. Returns whether the
    /// request finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut status = self.inner.status.lock();
        while !status.values().all(TileStatus::is_terminal) {
            if self.inner.finished.wait_for(&mut status, timeout).timed_out() {
                return status.values().all(TileStatus::is_terminal);
            }
        }
        true
    }

    /// Move a tile from pending to processing. Returns false if the tile is
    /// not pending (cancelled, already started or unknown).
    pub(crate) fn begin(&self, index: TileIndex) -> bool {
        let mut status = self.inner.status.lock();
        match status.get_mut(&index) {
            Some(s) if *s == TileStatus::Pending => {
                *s = TileStatus::Processing;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome of a tile that was processing.
    pub(crate) fn finish(&self, index: TileIndex, outcome: TileStatus) {
        let mut status = self.inner.status.lock();
        if let Some(s) = status.get_mut(&index) {
            *s = outcome;
        }
        self.inner.finished.notify_all();
    }

    /// Cancel pending tiles (all of them when `indices` is `None`).
    /// Returns the tiles that were actually cancelled.
    pub(crate) fn cancel(&self, indices: Option<&[TileIndex]>) -> Vec<TileIndex> {
        let mut status = self.inner.status.lock();
        let targets: Vec<TileIndex> = match indices {
            Some(indices) => indices.to_vec(),
            None => status.keys().copied().collect(),
        };
        let mut cancelled = Vec::new();
        for index in targets {
            if let Some(s) = status.get_mut(&index) {
                if *s == TileStatus::Pending {
                    *s = TileStatus::Cancelled;
                    cancelled.push(index);
                }
            }
        }
        self.inner.finished.notify_all();
        cancelled
    }
}

impl std::fmt::Debug for TileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileRequest")
            .field("id", &self.inner.id)
            .field("image", &self.inner.image)
            .field("tiles", &self.inner.indices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let index = TileIndex::new(0, 0);
        let request = TileRequest::new(ImageId::new(), vec![index], Vec::new());
        assert_eq!(request.tile_status(index), Some(TileStatus::Pending));
        assert!(request.begin(index));
        assert!(!request.begin(index));
        assert!(request.cancel(None).is_empty());
        request.finish(index, TileStatus::Computed);
        assert!(request.is_done());
        request.wait();
    }

    #[test]
    fn test_cancel_subset() {
        let a = TileIndex::new(0, 0);
        let b = TileIndex::new(1, 0);
        let request = TileRequest::new(ImageId::new(), vec![a, b], Vec::new());

        assert_eq!(request.cancel(Some(&[b, TileIndex::new(9, 9)])), vec![b]);
        assert_eq!(request.tile_status(b), Some(TileStatus::Cancelled));
        assert!(!request.is_done());
        assert!(!request.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_duplicates_share_status() {
        let a = TileIndex::new(2, 3);
        let request = TileRequest::new(ImageId::new(), vec![a, TileIndex::new(0, 0), a], Vec::new());
        assert_eq!(request.tile_indices().len(), 3);
        assert_eq!(request.unique_indices(), vec![a, TileIndex::new(0, 0)]);
    }

    #[test]
    fn test_callback_listener_forwards_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = CallbackListener::new(move |event| sink.lock().push(event));

        let request = TileRequest::new(ImageId::new(), Vec::new(), Vec::new());
        let error = TileError::IncompatibleRaster("bad".into());
        listener.tile_computation_failure(&request, request.image(), TileIndex::new(1, 1), &error);

        let events = events.lock();
        assert!(matches!(&events[0], TileEvent::Failed { error: e, .. } if *e == error));
    }
}
