//! Kernel image loading.
//!
//! The guest payload is an uncompressed 64-bit kernel image loaded flat at
//! the 1 MiB mark; the entry point is the load base. Format-aware loaders
//! (bzImage, ELF) are deliberately not part of this VMM.

use std::fs;

use log::info;

use super::layout::HIMEM_START;
use super::memory::GuestMemory;
use super::BootError;

/// Copy the kernel image into guest memory and return the entry point.
pub fn load_kernel(memory: &GuestMemory, path: &str) -> Result<u64, BootError> {
    let image = fs::read(path).map_err(BootError::ReadKernel)?;

    if HIMEM_START + image.len() as u64 > memory.size() {
        return Err(BootError::KernelTooLarge {
            size: image.len() as u64,
        });
    }

    memory.write(HIMEM_START, &image)?;
    info!(
        "loaded kernel image {} ({} bytes) at {:#x}",
        path,
        image.len(),
        HIMEM_START
    );

    Ok(HIMEM_START)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("kthxvm-image-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_load_flat_image() {
        let mem = GuestMemory::new(2 << 20).unwrap();
        let path = scratch_file("ok", &[0x90, 0x90, 0xf4]);
        let entry = load_kernel(&mem, path.to_str().unwrap()).unwrap();
        assert_eq!(entry, HIMEM_START);
        let mut buf = [0u8; 3];
        mem.read(HIMEM_START, &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0x90, 0xf4]);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_image_too_large() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let path = scratch_file("big", &[0u8; 16]);
        assert!(load_kernel(&mem, path.to_str().unwrap()).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file() {
        let mem = GuestMemory::new(2 << 20).unwrap();
        assert!(load_kernel(&mem, "/nonexistent/kernel").is_err());
    }
}
