use super::page::{Page, PageKind};
use crate::types::{PageId, Result, SealError};

/// Singly linked chain of reclaimed pages threaded through the page headers.
///
/// Both operations touch only the page being linked or unlinked.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FreeList {
    head: Option<PageId>,
    len: u32,
}

impl FreeList {
    /// Restores a list from its persisted head and length.
    pub fn new(head: Option<PageId>, len: u32) -> Self {
        Self { head, len }
    }

    /// First page to be reused.
    pub fn head(&self) -> Option<PageId> {
        self.head
    }

    /// Pages on the list.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True when no page is available for reuse.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Clears `page` and links it at the head.
    pub fn push(&mut self, page: &mut Page) {
        page.reset();
        page.set_kind(PageKind::Free);
        page.set_free_next(self.head);
        self.head = Some(page.id());
        self.len += 1;
    }

    /// Unlinks the head page. `page` must be the current head.
    pub fn pop(&mut self, page: &mut Page) -> Result<()> {
        if self.head != Some(page.id()) {
            return Err(SealError::Invalid("free list pop must target the head page"));
        }
        if page.kind() != PageKind::Free {
            return Err(SealError::Corruption("free list links a page in use"));
        }
        self.head = page.free_next();
        self.len = self.len.saturating_sub(1);
        page.set_free_next(None);
        page.set_kind(PageKind::Data);
        Ok(())
    }
}
