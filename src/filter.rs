//! Ingress frame filter.
//!
//! The gateway accepts a frame only when its id appears in the filter
//! table; everything else is dropped before routing. A table can also be
//! built explicitly open, accepting all traffic, which is how a
//! pass-through gateway is configured.
//!
//! The table is a flat id list scanned linearly. Id/mask pairs and
//! per-interface acceptance lists are a possible later refinement; the
//! source interface is already part of the lookup contract so that they
//! can slot in without touching callers.

use crate::device::DeviceId;

/// Accept/reject predicate applied to every ingress frame.
#[derive(Debug, Clone)]
pub struct FilterTable {
    ids: Option<Vec<u32>>,
}

impl FilterTable {
    /// Accept only the listed frame ids.
    pub fn accepting(ids: &[u32]) -> FilterTable {
        FilterTable {
            ids: Some(ids.to_vec()),
        }
    }

    /// Accept every frame.
    pub fn open() -> FilterTable {
        FilterTable { ids: None }
    }

    /// Decide acceptance for a frame received on `_source`.
    ///
    /// The minimal table ignores the source interface; it is part of the
    /// signature for per-interface filtering to build on.
    pub fn accepts(&self, _source: Option<DeviceId>, id: u32) -> bool {
        match &self.ids {
            None => true,
            Some(ids) => ids.iter().any(|&accepted| accepted == id),
        }
    }

    /// Accepted ids, or `None` for an open table. Used to mirror the
    /// table into kernel-side socket filters.
    pub fn ids(&self) -> Option<&[u32]> {
        self.ids.as_deref()
    }
}
