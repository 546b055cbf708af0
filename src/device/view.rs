//! Mapped Views
//!
//! The consumer side of a mapping: a lazily populated page table over a
//! session. Touching a page that is not yet present invokes the fault
//! resolver; later touches go straight to the installed page.
//!
//! A view enforces the protection it was mapped with, the way the MMU would
//! for `mmap(PROT_READ)` vs `mmap(PROT_WRITE)`.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{DevError, Result};
use crate::mm::address::page_number;
use crate::mm::{PAGE_MASK, PAGE_SIZE};

use super::buffer::BufferHandle;
use super::page::PageHandle;
use super::resolver::PageFaultResolver;
use super::session::{create_mapping, SessionHandle, SessionState};

bitflags! {
    /// Protection of a mapped view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A demand-paged view of a device buffer region.
pub struct MappedView<'r> {
    session: SessionHandle,
    resolver: &'r PageFaultResolver,
    prot: Prot,
    /// Installed pages, indexed by page number within the view.
    table: Mutex<Vec<Option<PageHandle>>>,
}

impl<'r> MappedView<'r> {
    /// Map `length` bytes of `buffer` starting at `offset`.
    ///
    /// `offset` must be page-aligned, as for `mmap`; [`create_mapping`]
    /// enforces it. No page is resolved until it is touched.
    pub fn map(
        buffer: &BufferHandle,
        offset: usize,
        length: usize,
        prot: Prot,
        resolver: &'r PageFaultResolver,
    ) -> Result<Self> {
        let session = create_mapping(buffer, offset, length)?;

        let mut table = Vec::new();
        table.resize_with(session.extent().pages(), || None);

        log::debug!(
            "{}: map session {} prot={:?} pages={}",
            buffer.id(),
            session.id(),
            prot,
            table.len()
        );

        Ok(Self {
            session,
            resolver,
            prot,
            table: Mutex::new(table),
        })
    }

    /// The session backing this view.
    #[inline]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Length of the view in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.session.extent().length()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn prot(&self) -> Prot {
        self.prot
    }

    /// Faults taken by this view so far.
    pub fn fault_count(&self) -> u64 {
        self.session.fault_count()
    }

    /// Pages currently installed in the view's table.
    pub fn resident_pages(&self) -> usize {
        self.table.lock().iter().filter(|p| p.is_some()).count()
    }

    /// Copy bytes out of the view.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_access(offset, out.len(), Prot::READ)?;
        let mut done = 0;
        while done < out.len() {
            let (page, at, chunk) = self.locate(offset + done, out.len() - done)?;
            page.read(at, &mut out[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes into the view.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_access(offset, data.len(), Prot::WRITE)?;
        let mut done = 0;
        while done < data.len() {
            let (page, at, chunk) = self.locate(offset + done, data.len() - done)?;
            page.write(at, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Fault in every page not yet present, as `MAP_POPULATE` would.
    ///
    /// Returns the number of pages newly installed.
    pub fn populate(&self) -> Result<usize> {
        if self.session.state() != SessionState::Open {
            return Err(DevError::InvalidState);
        }
        let mut table = self.table.lock();
        let mut installed = 0;
        for (index, entry) in table.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(self.resolver.resolve(&self.session, index)?);
                installed += 1;
            }
        }
        Ok(installed)
    }

    /// Tear the view down and close its session.
    ///
    /// Returns the number of faults the view took.
    pub fn unmap(self) -> Result<u64> {
        self.table.lock().clear();
        self.session.close()
    }

    fn check_access(&self, offset: usize, len: usize, need: Prot) -> Result<()> {
        if self.session.state() != SessionState::Open {
            return Err(DevError::InvalidState);
        }
        if !self.prot.contains(need) {
            return Err(DevError::ProtectionFault);
        }
        let end = offset.checked_add(len).ok_or(DevError::OutOfBounds)?;
        if end > self.len() {
            return Err(DevError::OutOfBounds);
        }
        Ok(())
    }

    /// Page, in-page offset and chunk length for an access at `pos`.
    fn locate(&self, pos: usize, remaining: usize) -> Result<(PageHandle, usize, usize)> {
        let at = pos & PAGE_MASK;
        let chunk = (PAGE_SIZE - at).min(remaining);
        Ok((self.page(page_number(pos))?, at, chunk))
    }

    /// The installed page at `index`, faulting it in if absent.
    fn page(&self, index: usize) -> Result<PageHandle> {
        let mut table = self.table.lock();
        let entry = table.get_mut(index).ok_or(DevError::OutOfBounds)?;
        if let Some(page) = entry.as_ref() {
            return Ok(page.clone());
        }
        let page = self.resolver.resolve(&self.session, index)?;
        *entry = Some(page.clone());
        Ok(page)
    }
}

impl fmt::Debug for MappedView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedView")
            .field("session", &self.session)
            .field("prot", &self.prot)
            .field("resident", &self.resident_pages())
            .finish()
    }
}

impl Drop for MappedView<'_> {
    fn drop(&mut self) {
        self.table.get_mut().clear();
        if self.session.state() == SessionState::Open {
            let _ = self.session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::device::{DeviceBuffer, DeviceId};
    use crate::mm::{BackingStore, GlobalStore};

    fn buffer(pages: usize) -> BufferHandle {
        let store: Arc<dyn BackingStore> = Arc::new(GlobalStore);
        DeviceBuffer::allocate(DeviceId::new(0), PAGE_SIZE * pages, &store).unwrap()
    }

    #[test]
    fn test_pages_fault_in_on_first_touch() {
        let buffer = buffer(8);
        let resolver = PageFaultResolver::new();
        let view = MappedView::map(&buffer, 0, PAGE_SIZE * 8, Prot::READ | Prot::WRITE, &resolver)
            .unwrap();
        assert_eq!(view.resident_pages(), 0);

        view.write(PAGE_SIZE - 2, b"span").unwrap();
        assert_eq!(view.fault_count(), 2);
        assert_eq!(view.resident_pages(), 2);

        // Already installed: no new faults.
        let mut out = [0u8; 4];
        view.read(PAGE_SIZE - 2, &mut out).unwrap();
        assert_eq!(&out, b"span");
        assert_eq!(view.fault_count(), 2);

        assert_eq!(view.unmap(), Ok(2));
        assert_eq!(buffer.pinned_pages(), 0);
        assert_eq!(buffer.open_sessions(), 0);
    }

    #[test]
    fn test_populate_prefaults_remaining_pages() {
        let buffer = buffer(4);
        let resolver = PageFaultResolver::new();
        let view = MappedView::map(&buffer, 0, PAGE_SIZE * 4, Prot::READ, &resolver).unwrap();
        let mut out = [0u8; 1];
        view.read(PAGE_SIZE, &mut out).unwrap();

        assert_eq!(view.populate(), Ok(3));
        assert_eq!(view.fault_count(), 4);
        assert_eq!(view.populate(), Ok(0));
        assert_eq!(view.resident_pages(), 4);
    }

    #[test]
    fn test_read_only_view_rejects_writes() {
        let buffer = buffer(2);
        let resolver = PageFaultResolver::new();
        let view = MappedView::map(&buffer, 0, PAGE_SIZE, Prot::READ, &resolver).unwrap();
        assert_eq!(view.write(0, b"x"), Err(DevError::ProtectionFault));
        assert_eq!(view.fault_count(), 0);
    }

    #[test]
    fn test_access_past_view_end() {
        let buffer = buffer(4);
        let resolver = PageFaultResolver::new();
        let view =
            MappedView::map(&buffer, PAGE_SIZE, PAGE_SIZE + 10, Prot::READ, &resolver).unwrap();
        let mut out = [0u8; 8];
        assert!(view.read(PAGE_SIZE + 2, &mut out).is_ok());
        assert_eq!(view.read(PAGE_SIZE + 3, &mut out), Err(DevError::OutOfBounds));
    }

    #[test]
    fn test_unaligned_offset_refused() {
        let buffer = buffer(4);
        let resolver = PageFaultResolver::new();
        assert_eq!(
            MappedView::map(&buffer, 100, PAGE_SIZE, Prot::READ, &resolver).unwrap_err(),
            DevError::OutOfBounds
        );
        assert_eq!(buffer.open_sessions(), 0);
    }

    #[test]
    fn test_views_share_device_memory() {
        let buffer = buffer(4);
        let resolver = PageFaultResolver::new();
        let a = MappedView::map(&buffer, 0, PAGE_SIZE * 4, Prot::WRITE, &resolver).unwrap();
        let b = MappedView::map(&buffer, PAGE_SIZE * 2, PAGE_SIZE * 2, Prot::READ, &resolver)
            .unwrap();

        a.write(PAGE_SIZE * 2 + 5, b"shared").unwrap();
        let mut out = [0u8; 6];
        b.read(5, &mut out).unwrap();
        assert_eq!(&out, b"shared");
    }

    #[test]
    fn test_drop_closes_session() {
        let buffer = buffer(2);
        let resolver = PageFaultResolver::new();
        let view = MappedView::map(&buffer, 0, PAGE_SIZE, Prot::READ, &resolver).unwrap();
        let mut out = [0u8; 1];
        view.read(0, &mut out).unwrap();
        drop(view);
        assert_eq!(buffer.open_sessions(), 0);
        assert_eq!(buffer.pinned_pages(), 0);
    }
}
