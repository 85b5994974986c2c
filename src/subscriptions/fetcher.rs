//! Candidate documents for one batch.

use crate::cluster::ResendItem;
use crate::documents::{DocumentsStorage, ReadContext};
use crate::types::{Document, DocumentOrTombstone, Etag};
use std::collections::VecDeque;

/// A candidate and where it came from.
#[derive(Clone, Debug)]
pub enum FetchedItem {
    /// Next document in etag order after the scan position.
    Storage(Document),
    /// A queued resend entry, resolved against what storage holds now.
    Resend {
        entry: ResendItem,
        current: DocumentOrTombstone,
    },
}

/// Single-pass candidate stream: resend entries first, then storage pages.
///
/// Storage is read one page at a time, so the scan stops as soon as the
/// consumer stops pulling.
pub struct DocumentFetcher<'a> {
    storage: &'a DocumentsStorage,
    ctx: &'a ReadContext,
    collection: Option<String>,
    page_size: usize,
    resend: std::vec::IntoIter<ResendItem>,
    position: Etag,
    page: VecDeque<Document>,
    exhausted: bool,
}

impl<'a> DocumentFetcher<'a> {
    pub fn new(
        storage: &'a DocumentsStorage,
        ctx: &'a ReadContext,
        collection: Option<String>,
        start_after: Etag,
        resend: Vec<ResendItem>,
        page_size: usize,
    ) -> Self {
        Self {
            storage,
            ctx,
            collection,
            page_size: page_size.max(1),
            resend: resend.into_iter(),
            position: start_after,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    fn next_page(&mut self) {
        let page = self.storage.documents_after(
            self.ctx,
            self.collection.as_deref(),
            self.position,
            self.page_size,
        );
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.position = last.etag;
        }
        self.page.extend(page);
    }
}

impl Iterator for DocumentFetcher<'_> {
    type Item = FetchedItem;

    fn next(&mut self) -> Option<FetchedItem> {
        if let Some(entry) = self.resend.next() {
            let current = self.storage.get_document_or_tombstone(&entry.id);
            return Some(FetchedItem::Resend { entry, current });
        }
        if self.page.is_empty() && !self.exhausted {
            self.next_page();
        }
        self.page.pop_front().map(FetchedItem::Storage)
    }
}
