//! # dbghelp FFI Declarations
//!
//! `SymGetTypeInfo` is called against the engine's own dbghelp session
//! handle, which the COM interfaces do not expose a wrapper for.

use std::ffi::c_void;

#[link(name = "dbghelp")]
extern "system" {
    /// `BOOL SymGetTypeInfo(HANDLE, DWORD64, ULONG, IMAGEHLP_SYMBOL_TYPE_INFO, PVOID)`
    pub fn SymGetTypeInfo(process: isize, module_base: u64, type_id: u32, get_type: u32, info: *mut c_void) -> i32;
}

#[link(name = "kernel32")]
extern "system" {
    /// Frees the name buffers `TI_GET_SYMNAME` allocates.
    pub fn LocalFree(memory: *mut c_void) -> *mut c_void;

    pub fn GetLastError() -> u32;
}
