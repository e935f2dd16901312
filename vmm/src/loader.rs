/// Flat-binary guest image loader
use log::info;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vm_memory::{
    Bytes, GuestAddress, GuestMemory, GuestMemoryError, GuestMemoryMmap, GuestMemoryRegion,
};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("unable to open guest image {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read guest image: {0}")]
    Read(#[source] std::io::Error),

    #[error("guest image exceeds memory region ({size} > {capacity} bytes)")]
    TooLarge { size: usize, capacity: usize },

    #[error("no guest memory at 0x{0:x}")]
    NoRegion(u64),

    #[error("failed to write guest image: {0}")]
    Write(#[source] GuestMemoryError),
}

/// Bytes available from `base` to the end of the region containing it.
fn capacity_at(memory: &GuestMemoryMmap<()>, base: GuestAddress) -> Result<usize, LoadError> {
    let region = memory
        .find_region(base)
        .ok_or(LoadError::NoRegion(base.0))?;
    let offset = base.0 - region.start_addr().0;
    Ok((region.len() - offset) as usize)
}

/// Copy all of `source` into guest memory at `base`. Returns the image size.
pub fn load_image<R: Read>(
    source: R,
    memory: &GuestMemoryMmap<()>,
    base: GuestAddress,
) -> Result<usize, LoadError> {
    let capacity = capacity_at(memory, base)?;

    // One byte past capacity is enough to tell an oversize image.
    let mut image = Vec::new();
    source
        .take(capacity as u64 + 1)
        .read_to_end(&mut image)
        .map_err(LoadError::Read)?;
    if image.len() > capacity {
        return Err(LoadError::TooLarge {
            size: image.len(),
            capacity,
        });
    }

    memory
        .write_slice(&image, base)
        .map_err(LoadError::Write)?;
    Ok(image.len())
}

pub fn load_image_file(
    path: &Path,
    memory: &GuestMemoryMmap<()>,
    base: GuestAddress,
) -> Result<usize, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let size = load_image(file, memory, base)?;
    info!(
        "Loaded guest image {} ({} bytes) at GPA 0x{:x}",
        path.display(),
        size,
        base.0
    );
    Ok(size)
}
