//! Pending request table — one single-use completion handle per
//! outstanding request.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::BspError;
use crate::message::Response;
use crate::protocol::RequestId;

pub(crate) type CallResult = Result<Response, BspError>;
pub(crate) type CallerHandle = oneshot::Sender<CallResult>;

pub(crate) struct PendingTable {
    entries: HashMap<RequestId, CallerHandle>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the handle back if `id` is already pending.
    pub fn reserve(&mut self, id: RequestId, handle: CallerHandle) -> Result<(), CallerHandle> {
        if self.entries.contains_key(&id) {
            return Err(handle);
        }
        self.entries.insert(id, handle);
        Ok(())
    }

    /// Remove and signal the entry for `id`. Returns whether one existed.
    ///
    /// A caller that has since gone away still counts as matched.
    pub fn resolve(&mut self, id: RequestId, response: Response) -> bool {
        match self.entries.remove(&id) {
            Some(handle) => {
                let _ = handle.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub fn fail(&mut self, id: RequestId, error: BspError) -> bool {
        match self.entries.remove(&id) {
            Some(handle) => {
                let _ = handle.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every entry with the same error. Returns how many were failed.
    pub fn fail_all(&mut self, error: &BspError) -> usize {
        let count = self.entries.len();
        for (_, handle) in self.entries.drain() {
            let _ = handle.send(Err(error.clone()));
        }
        count
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseOutcome;

    fn response(id: u64) -> Response {
        Response {
            id: Some(RequestId::new(id)),
            outcome: ResponseOutcome::Result(serde_json::json!({"id": id})),
        }
    }

    #[tokio::test]
    async fn test_resolve_signals_matching_caller_once() {
        let mut table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table.reserve(RequestId::new(1), tx).unwrap();
        assert_eq!(table.count(), 1);

        assert!(table.resolve(RequestId::new(1), response(1)));
        assert_eq!(table.count(), 0);
        assert!(!table.resolve(RequestId::new(1), response(1)));

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.result().unwrap()["id"], 1);
    }

    #[test]
    fn test_resolve_unknown_id_leaves_table_untouched() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        table.reserve(RequestId::new(2), tx).unwrap();

        assert!(!table.resolve(RequestId::new(99), response(99)));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_reserve_rejects_duplicate_id() {
        let mut table = PendingTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        table.reserve(RequestId::new(5), tx1).unwrap();
        assert!(table.reserve(RequestId::new(5), tx2).is_err());
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_resolve_with_dropped_caller_still_matches() {
        let mut table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table.reserve(RequestId::new(3), tx).unwrap();
        drop(rx);
        assert!(table.resolve(RequestId::new(3), response(3)));
        assert_eq!(table.count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_broadcasts_and_empties() {
        let mut table = PendingTable::new();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        table.reserve(RequestId::new(2), tx2).unwrap();
        table.reserve(RequestId::new(3), tx3).unwrap();

        let failed = table.fail_all(&BspError::closed("pipe closed"));
        assert_eq!(failed, 2);
        assert_eq!(table.count(), 0);
        assert!(rx2.await.unwrap().unwrap_err().is_connection_closed());
        assert!(rx3.await.unwrap().unwrap_err().is_connection_closed());
    }

    #[tokio::test]
    async fn test_fail_single_entry() {
        let mut table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table.reserve(RequestId::new(8), tx).unwrap();
        assert!(table.fail(RequestId::new(8), BspError::closed("x")));
        assert!(!table.fail(RequestId::new(8), BspError::closed("x")));
        assert!(rx.await.unwrap().is_err());
    }
}
