/// Returns the shared-library names to try, in order, when loading the HIP runtime.
pub fn hip_library_candidates() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["amdhip64_6.dll", "amdhip64.dll"]
    }
    #[cfg(target_os = "linux")]
    {
        &["libamdhip64.so.6", "libamdhip64.so", "/opt/rocm/lib/libamdhip64.so"]
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        &[]
    }
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}
