//! Assembles the concrete page-source pipeline a `Database` hands to each
//! cursor: raw bytes → optional WAL overlay → transform → cache. Grounded on
//! spec §9's redesign note ("sealed-class specialisation... re-expressed as
//! a small tagged variant over concrete cursor strategies... dispatch is a
//! match on the tag") -- `RawSource` and `MaybeWal` are exactly that tagged
//! variant, rather than a trait object, so the cursor's hot loop stays
//! monomorphic.
//!
//! Each cursor gets its own clone of the pipeline rather than sharing one
//! source behind a lock: `RawSource::try_clone` duplicates a file descriptor
//! (or bumps an `Rc` for memory sources) cheaply, and each clone owns its
//! own bounded LRU cache and scratch buffers. This departs from spec §5's
//! literal "single shared cache behind one guard" in exchange for avoiding
//! unsafe lifetime games around a shared mutable `&mut self` page source;
//! see DESIGN.md for the tradeoff.

use std::sync::Arc;

use crate::error::Result;
use crate::page::cache::CachingPageSource;
use crate::page::transform::{PageTransform, TransformingPageSource};
use crate::page::{FilePageSource, MemoryPageSource, PageNum, PageSource};
use crate::wal::WalOverlay;

/// The two concrete backing stores a `Database` can be opened against.
#[derive(Clone)]
pub enum RawSource {
    File(FilePageSource),
    Memory(MemoryPageSource),
}

impl RawSource {
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            RawSource::File(f) => RawSource::File(f.try_clone()?),
            RawSource::Memory(m) => RawSource::Memory(m.clone()),
        })
    }
}

impl PageSource for RawSource {
    fn page_size(&self) -> u32 {
        match self {
            RawSource::File(f) => f.page_size(),
            RawSource::Memory(m) => m.page_size(),
        }
    }

    fn page_count(&self) -> u32 {
        match self {
            RawSource::File(f) => f.page_count(),
            RawSource::Memory(m) => m.page_count(),
        }
    }

    fn data_version(&self) -> u64 {
        match self {
            RawSource::File(f) => f.data_version(),
            RawSource::Memory(m) => m.data_version(),
        }
    }

    fn get_page(&mut self, page_number: PageNum) -> Result<&[u8]> {
        match self {
            RawSource::File(f) => f.get_page(page_number),
            RawSource::Memory(m) => m.get_page(page_number),
        }
    }
}

/// Either the bare main-file source, or the same wrapped in a WAL overlay
/// (spec §4.6). A tag, not a trait object -- same rationale as `RawSource`.
#[derive(Clone)]
pub enum MaybeWal {
    Plain(RawSource),
    Wal(WalOverlay<RawSource>),
}

impl MaybeWal {
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            MaybeWal::Plain(s) => MaybeWal::Plain(s.try_clone()?),
            MaybeWal::Wal(w) => MaybeWal::Wal(w.clone()),
        })
    }
}

impl PageSource for MaybeWal {
    fn page_size(&self) -> u32 {
        match self {
            MaybeWal::Plain(s) => s.page_size(),
            MaybeWal::Wal(w) => w.page_size(),
        }
    }

    fn page_count(&self) -> u32 {
        match self {
            MaybeWal::Plain(s) => s.page_count(),
            MaybeWal::Wal(w) => w.page_count(),
        }
    }

    fn data_version(&self) -> u64 {
        match self {
            MaybeWal::Plain(s) => s.data_version(),
            MaybeWal::Wal(w) => w.data_version(),
        }
    }

    fn get_page(&mut self, page_number: PageNum) -> Result<&[u8]> {
        match self {
            MaybeWal::Plain(s) => s.get_page(page_number),
            MaybeWal::Wal(w) => w.get_page(page_number),
        }
    }
}

/// The full per-cursor pipeline: cache on top of transform on top of the
/// (possibly WAL-overlaid) raw source.
pub type Pipeline = CachingPageSource<TransformingPageSource<MaybeWal>>;

pub fn build_pipeline(raw: MaybeWal, transform: Arc<dyn PageTransform + Send + Sync>, cache_capacity: usize) -> Pipeline {
    let transformed = TransformingPageSource::new(raw, transform);
    CachingPageSource::with_capacity(transformed, cache_capacity)
}
