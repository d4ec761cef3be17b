//! Executable memory for installed code.
//!
//! A region is reserved read-write first so emission can consult its bounds
//! when choosing branch encodings, then sealed code is committed into it:
//! copied, relocated against the final base address, and flipped to
//! read-execute with an instruction-cache flush where the platform needs one.

use crate::buffer::{MasmError, SealedCode};
use crate::cache::CodeCacheBounds;
use crate::reloc::apply_relocations;

#[derive(Debug)]
pub enum ExecError {
    Os(String),
    CapacityExceeded { needed: usize, capacity: usize },
    Reloc(MasmError),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Os(message) => write!(f, "{message}"),
            ExecError::CapacityExceeded { needed, capacity } => {
                write!(f, "code needs {needed} bytes but region holds {capacity}")
            }
            ExecError::Reloc(err) => write!(f, "relocation failed: {err}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<MasmError> for ExecError {
    fn from(err: MasmError) -> Self {
        ExecError::Reloc(err)
    }
}

/// One mapped executable region; unmapped on drop.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
    committed: usize,
}

impl ExecutableMemory {
    /// Reserves a read-write region of `capacity` bytes.
    pub fn reserve(capacity: usize) -> Result<Self, ExecError> {
        if capacity == 0 {
            return Err(ExecError::Os(
                "cannot reserve an empty executable region".to_string(),
            ));
        }
        let ptr = alloc_region(capacity)?;
        Ok(ExecutableMemory {
            ptr,
            len: capacity,
            committed: 0,
        })
    }

    /// Bounds of the region, for branch-encoding decisions during emission.
    pub fn bounds(&self) -> CodeCacheBounds {
        CodeCacheBounds::new(self.ptr as u64, self.ptr as u64 + self.len as u64)
    }

    /// Installs sealed code at the start of the region and makes it
    /// executable. Returns the entry address.
    pub fn commit(&mut self, sealed: &SealedCode) -> Result<*const u8, ExecError> {
        if sealed.code.len() > self.len {
            return Err(ExecError::CapacityExceeded {
                needed: sealed.code.len(),
                capacity: self.len,
            });
        }
        let mut code = sealed.code.clone();
        apply_relocations(&mut code, &sealed.relocs, self.ptr as u64)?;
        write_code(self.ptr, &code);
        finalize_region(self.ptr, self.len)?;
        self.committed = code.len();
        tracing::debug!(
            base = self.ptr as u64,
            bytes = code.len(),
            relocs = sealed.relocs.len(),
            "committed executable code"
        );
        Ok(self.ptr as *const u8)
    }

    pub fn entry(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Bytes of code installed by the last successful [`commit`](Self::commit).
    pub fn committed_len(&self) -> usize {
        self.committed
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        let _ = free_region(self.ptr, self.len);
    }
}

fn write_code(ptr: *mut u8, code: &[u8]) {
    #[cfg(target_os = "macos")]
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(not(target_os = "macos"))]
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }
}

#[cfg(target_os = "windows")]
fn finalize_region(ptr: *mut u8, len: usize) -> Result<(), ExecError> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            Memory::{PAGE_EXECUTE_READ, VirtualProtect},
            Threading::GetCurrentProcess,
        },
    };

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(ExecError::Os(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(ExecError::Os(format!(
            "FlushInstructionCache failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_region(ptr: *mut u8, len: usize) -> Result<(), ExecError> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(ExecError::Os(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mut addr = ptr as usize & !63;
        let end = ptr as usize + len;
        while addr < end {
            std::arch::asm!("dc cvau, {0}", "ic ivau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish", "isb");
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn finalize_region(_ptr: *mut u8, _len: usize) -> Result<(), ExecError> {
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(target_os = "windows")]
fn alloc_region(len: usize) -> Result<*mut u8, ExecError> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(ExecError::Os(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn free_region(ptr: *mut u8, _len: usize) -> Result<(), ExecError> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(ExecError::Os(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_region(len: usize) -> Result<*mut u8, ExecError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ExecError::Os(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_region(len: usize) -> Result<*mut u8, ExecError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ExecError::Os(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn free_region(ptr: *mut u8, len: usize) -> Result<(), ExecError> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(ExecError::Os(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_region(_len: usize) -> Result<*mut u8, ExecError> {
    Err(ExecError::Os(
        "executable memory allocation not implemented for this platform".to_string(),
    ))
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_region(_ptr: *mut u8, _len: usize) -> Result<(), ExecError> {
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn finalize_region(_ptr: *mut u8, _len: usize) -> Result<(), ExecError> {
    Ok(())
}
