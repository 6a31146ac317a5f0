use crate::primitives::buffer::{FileHandle, PageGuard, PageReadPolicy};
use crate::storage::shadow::ShadowFile;
use crate::types::{PageId, Result, UmbraError};

/// A pinned shadow page together with the page it stands in for.
pub struct ShadowPageAndFrame {
    /// Page of the data file being replaced.
    pub original_page: PageId,
    /// Page of the shadow file holding the new contents.
    pub shadow_page: PageId,
    /// Exclusive pin on the shadow page; released on drop.
    pub guard: PageGuard,
}

/// Pins the shadow copy of `original`, creating it on first use. A new copy
/// starts from the original's bytes unless `skip_read_original` says the
/// caller overwrites the whole page.
pub fn create_shadow_version_if_necessary_and_pin_page(
    original: PageId,
    skip_read_original: bool,
    fh: &FileHandle,
    shadow: &ShadowFile,
) -> Result<ShadowPageAndFrame> {
    let existed = shadow.has_shadow_page(fh.file_idx(), original);
    let shadow_page = shadow.get_or_create_shadow_page(fh.file_idx(), original)?;
    let shadow_fh = shadow.shadowing_fh()?;
    let guard = if existed {
        shadow_fh.pin_page(shadow_page, PageReadPolicy::ReadPage)?
    } else {
        let mut guard = shadow_fh.pin_page(shadow_page, PageReadPolicy::DontReadPage)?;
        if skip_read_original {
            guard.data_mut().fill(0);
        } else {
            fh.read_page(original, |bytes| guard.data_mut().copy_from_slice(bytes))?;
        }
        guard
    };
    Ok(ShadowPageAndFrame {
        original_page: original,
        shadow_page,
        guard,
    })
}

/// Applies `op` to the shadow copy of `original` and marks it dirty.
pub fn update_page<R>(
    fh: &FileHandle,
    original: PageId,
    skip_read_original: bool,
    shadow: &ShadowFile,
    op: impl FnOnce(&mut [u8]) -> R,
) -> Result<R> {
    let mut frame =
        create_shadow_version_if_necessary_and_pin_page(original, skip_read_original, fh, shadow)?;
    Ok(op(frame.guard.data_mut()))
}

/// Runs `op` over the shadow copy of `original`, which must exist.
pub fn read_shadow_version_of_page<R>(
    fh: &FileHandle,
    original: PageId,
    shadow: &ShadowFile,
    op: impl FnOnce(&[u8]) -> R,
) -> Result<R> {
    let shadow_page = shadow
        .shadow_page(fh.file_idx(), original)
        .ok_or(UmbraError::Corruption("no shadow copy for page"))?;
    shadow.shadowing_fh()?.read_page(shadow_page, op)
}

/// Runs `op` over the newest version of `page`: the shadow copy when one
/// exists, the data file otherwise.
pub fn read_page_maybe_shadowed<R>(
    fh: &FileHandle,
    page: PageId,
    shadow: &ShadowFile,
    op: impl FnOnce(&[u8]) -> R,
) -> Result<R> {
    if shadow.has_shadow_page(fh.file_idx(), page) {
        read_shadow_version_of_page(fh, page, shadow, op)
    } else {
        fh.read_page(page, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::buffer::BufferManager;
    use crate::primitives::io::{MemFileIo, MemVfs};
    use crate::storage::shadow::DATA_FILE_IDX;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn first_shadow_copy_preserves_original_bytes() -> Result<()> {
        let pool = BufferManager::new(16);
        let fh = FileHandle::open(
            DATA_FILE_IDX,
            "db",
            Arc::new(MemFileIo::default()),
            pool.clone(),
            false,
        )?;
        fh.add_new_pages(4)?;
        fh.write_page_to_file(PageId(2), &[9u8; crate::types::PAGE_SIZE])?;
        let shadow = ShadowFile::new(Path::new("db"), Arc::new(MemVfs::default()), pool.clone(), false);

        update_page(&fh, PageId(2), false, &shadow, |bytes| bytes[1] = 1)?;
        update_page(&fh, PageId(2), false, &shadow, |bytes| bytes[2] = 2)?;
        let seen = read_page_maybe_shadowed(&fh, PageId(2), &shadow, |bytes| bytes[..4].to_vec())?;
        assert_eq!(seen, vec![9, 1, 2, 9]);
        fh.read_page(PageId(2), |bytes| assert_eq!(bytes[1], 9))?;
        assert!(read_shadow_version_of_page(&fh, PageId(3), &shadow, |_| ()).is_err());
        assert_eq!(pool.pinned_pages(), 0);
        Ok(())
    }
}
