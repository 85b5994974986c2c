//! Per-shard document storage and its single-writer merger.

mod merger;
mod storage;

pub use merger::{CommitHook, MergerCommand, MergerReply, TransactionMerger};
pub use storage::{DeleteBucketResult, DocumentsStorage, ReadContext, StoredItem};
