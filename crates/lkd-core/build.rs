//! Build script for lkd-core
//!
//! This script checks build requirements before compilation:
//! - Minimum Rust version
//! - Whether the native debugging engine is available on the target
//!
//! ## Requirements
//!
//! - **Rust**: 1.76.0 or newer
//! - **Windows**: DbgEng (`dbgeng.dll`, `dbghelp.dll`) for local kernel debugging
//! - **Other targets**: build fine, with only the fixture engine available

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    // `std::ptr::from_mut` and friends are used by the engine bindings
    let min_rust_version = rustc_version::Version::new(1, 76, 0);
    match rustc_version::version() {
        Ok(rustc_version) if rustc_version < min_rust_version => {
            panic!("lkd-core requires Rust {} or newer, found {}", min_rust_version, rustc_version);
        }
        Ok(_) => {}
        // If we can't get version (e.g., in some build environments), just warn
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        println!("cargo:warning=lkd-core: no native debugging engine on this target; only the fixture engine is available");
    }
}
