#![forbid(unsafe_code)]

mod freelist;
mod meta;
mod page;
mod pager;

pub use freelist::FreeList;
pub use meta::Meta;
pub use page::{Page, PageKind, SlotContent, MIN_RECORD_LEN, PAGE_HEADER_LEN, SLOT_ENTRY_LEN};
pub use pager::{PageFile, PagerOptions, PagerStats, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
