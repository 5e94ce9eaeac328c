//! Linux implementations of the hardware abstraction layer.
//!
//! - [`PciAddress`]: a device address and its sysfs directory
//! - [`ResourceFile`]: `pread`/`pwrite` access to a PCI resource file, used
//!   for configuration space and I/O port BARs (legacy VirtIO)
//! - [`MappedResource`]: an `mmap`ed memory BAR (82599)
//! - [`LinuxHal`]: hugetlbfs backed DMA memory and `/proc/self/pagemap`
//!
//! All of this needs root.

use core::fmt;
use core::ptr::{self, NonNull};
use core::str::FromStr;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::hal::{IxyHal, ResourceIo, Width};
use crate::{IxyError, IxyResult};

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
const HUGETLBFS_MOUNT: &str = "/mnt/huge";
const PAGEMAP: &str = "/proc/self/pagemap";

/// Address of a PCI function, `dddd:bb:dd.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    /// PCI domain (segment).
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number, 0..32.
    pub device: u8,
    /// Function number, 0..8.
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = IxyError;

    /// Parses `dddd:bb:dd.f`; the domain may be left out.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || IxyError::Parse(s.to_string());

        let (rest, function) = s.rsplit_once('.').ok_or_else(bad)?;
        let mut parts = rest.rsplitn(3, ':');
        let device = parts.next().ok_or_else(bad)?;
        let bus = parts.next().ok_or_else(bad)?;
        let domain = parts.next().unwrap_or("0");

        let addr = PciAddress {
            domain: u16::from_str_radix(domain, 16).map_err(|_| bad())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| bad())?,
            device: u8::from_str_radix(device, 16).map_err(|_| bad())?,
            function: u8::from_str_radix(function, 16).map_err(|_| bad())?,
        };
        if addr.device >= 32 || addr.function >= 8 {
            return Err(bad());
        }
        Ok(addr)
    }
}

impl PciAddress {
    /// The device's directory in sysfs.
    pub fn sysfs_path(&self) -> PathBuf {
        Path::new(SYSFS_PCI_DEVICES).join(self.to_string())
    }

    /// Detaches the kernel driver from the device, if one is bound.
    pub fn unbind_driver(&self) -> IxyResult {
        let path = self.sysfs_path().join("driver/unbind");
        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                file.write_all_at(self.to_string().as_bytes(), 0)?;
                info!("unbound kernel driver from {self}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no driver bound to {self}");
                Ok(())
            }
            Err(e) => {
                warn!("could not unbind {}: {e}", path.display());
                Err(e.into())
            }
        }
    }

    /// Opens `resource` (e.g. `config`) for `pread`/`pwrite` access.
    pub fn open_resource(&self, resource: &str) -> IxyResult<ResourceFile> {
        ResourceFile::open(self.sysfs_path().join(resource))
    }

    /// Maps the memory BAR `resource` (e.g. `resource0`).
    pub fn map_resource(&self, resource: &str) -> IxyResult<MappedResource> {
        MappedResource::map(self.sysfs_path().join(resource))
    }
}

/// A PCI resource accessed with positional reads and writes.
#[derive(Debug)]
pub struct ResourceFile {
    file: File,
    path: PathBuf,
}

impl ResourceFile {
    /// Opens the resource file at `path` read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> IxyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("opened {}", path.display());
        Ok(ResourceFile { file, path })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResourceIo for ResourceFile {
    fn read_at(&self, offset: u32, width: Width) -> IxyResult<u32> {
        let mut buf = [0u8; 4];
        self.file
            .read_exact_at(&mut buf[..width.bytes()], offset as u64)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_at(&self, offset: u32, value: u32, width: Width) -> IxyResult {
        let buf = value.to_le_bytes();
        self.file
            .write_all_at(&buf[..width.bytes()], offset as u64)?;
        Ok(())
    }
}

/// A memory BAR mapped into the process.
#[derive(Debug)]
pub struct MappedResource {
    addr: NonNull<u8>,
    len: usize,
}

impl MappedResource {
    /// Maps the whole resource file at `path`.
    pub fn map<P: AsRef<Path>>(path: P) -> IxyResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        debug!("mapped {} ({len:#x} bytes) at {addr:p}", path.display());

        Ok(MappedResource {
            addr: NonNull::new(addr as *mut u8).ok_or(IxyError::NoMemory)?,
            len,
        })
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for an empty BAR.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u32, width: Width) -> IxyResult<*mut u8> {
        let offset = offset as usize;
        if offset % width.bytes() != 0 || offset + width.bytes() > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("register {offset:#x} outside of BAR ({:#x} bytes)", self.len),
            )
            .into());
        }
        Ok(unsafe { self.addr.as_ptr().add(offset) })
    }
}

impl ResourceIo for MappedResource {
    fn read_at(&self, offset: u32, width: Width) -> IxyResult<u32> {
        let reg = self.check(offset, width)?;
        Ok(unsafe {
            match width {
                Width::U8 => ptr::read_volatile(reg) as u32,
                Width::U16 => ptr::read_volatile(reg as *const u16) as u32,
                Width::U32 => ptr::read_volatile(reg as *const u32),
            }
        })
    }

    fn write_at(&self, offset: u32, value: u32, width: Width) -> IxyResult {
        let reg = self.check(offset, width)?;
        unsafe {
            match width {
                Width::U8 => ptr::write_volatile(reg, value as u8),
                Width::U16 => ptr::write_volatile(reg as *mut u16, value as u16),
                Width::U32 => ptr::write_volatile(reg as *mut u32, value),
            }
        }
        Ok(())
    }
}

impl Drop for MappedResource {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.addr.as_ptr() as *mut libc::c_void, self.len) };
    }
}

/// DMA memory from hugetlbfs mounted at `/mnt/huge`.
pub struct LinuxHal;

static HUGEPAGE_ID: AtomicUsize = AtomicUsize::new(0);

unsafe impl IxyHal for LinuxHal {
    fn map_hugepages(size: usize) -> IxyResult<NonNull<u8>> {
        let id = HUGEPAGE_ID.fetch_add(1, Ordering::Relaxed);
        let path = Path::new(HUGETLBFS_MOUNT).join(format!("ixy-{}-{id}", std::process::id()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB,
                file.as_raw_fd(),
                0,
            )
        };
        // the mapping keeps the pages alive, the name is not needed anymore
        let unlinked = fs::remove_file(&path);
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        if let Err(e) = unlinked {
            warn!("could not remove {}: {e}", path.display());
        }

        // never swap out DMA memory
        if unsafe { libc::mlock(addr, size) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(addr, size) };
            return Err(err.into());
        }

        debug!("mapped {size:#x} bytes of hugepages at {addr:p}");
        NonNull::new(addr as *mut u8).ok_or(IxyError::NoMemory)
    }

    unsafe fn unmap_hugepages(vaddr: NonNull<u8>, size: usize) {
        libc::munlock(vaddr.as_ptr() as *const libc::c_void, size);
        libc::munmap(vaddr.as_ptr() as *mut libc::c_void, size);
    }

    fn pagemap_entry(page_index: usize) -> IxyResult<u64> {
        let file = File::open(PAGEMAP)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, (page_index * 8) as u64)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn wait(duration: Duration) {
        std::thread::sleep(duration);
    }
}
