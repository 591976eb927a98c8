//! Core services: the ledger, the blob store, finalization and the coordinator
//! that ties them together.

pub mod blob_store;
pub mod coordinator;
pub mod finalizer;
pub mod ledger;
pub mod retry;

#[cfg(test)]
pub mod test_support;
