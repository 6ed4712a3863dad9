//! Symbol resolution providers.
//!
//! Resolution by instruction pointer is a collaborator concern; the
//! core only needs the two lookups below. The default implementation
//! asks the dynamic loader.

use std::ffi::CStr;

/// The binary image containing an instruction pointer.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Filesystem path of the image
    pub path: String,
    /// Address the image is loaded at
    pub base: u64,
}

/// Resolution of instruction pointers to names and images. Pure and
/// idempotent; both lookups may come back empty.
pub trait SymbolResolver: Send + Sync {
    /// Human-readable name of the function containing `ip`.
    fn resolve(&self, ip: u64) -> Option<String>;

    /// Image containing `ip`, for per-frame offset computation.
    fn image_of(&self, ip: u64) -> Option<ImageInfo>;
}

/// Resolver backed by `dladdr`. Names are demangled.
#[derive(Debug, Default)]
pub struct DladdrResolver;

impl DladdrResolver {
    fn dladdr(ip: u64) -> Option<libc::Dl_info> {
        if ip == 0 {
            return None;
        }
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::dladdr(ip as *const libc::c_void, &mut info) };
        if rc == 0 {
            None
        } else {
            Some(info)
        }
    }
}

impl SymbolResolver for DladdrResolver {
    fn resolve(&self, ip: u64) -> Option<String> {
        let info = Self::dladdr(ip)?;
        if info.dli_sname.is_null() {
            return None;
        }
        let raw = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
        Some(rustc_demangle::demangle(&raw).to_string())
    }

    fn image_of(&self, ip: u64) -> Option<ImageInfo> {
        let info = Self::dladdr(ip)?;
        if info.dli_fname.is_null() {
            return None;
        }
        let path = unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned();
        Some(ImageInfo {
            path,
            base: info.dli_fbase as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_ip_resolves_to_nothing() {
        let resolver = DladdrResolver;
        assert!(resolver.resolve(0).is_none());
        assert!(resolver.image_of(0).is_none());
    }

    #[test]
    fn libc_functions_are_located() {
        let resolver = DladdrResolver;
        let ip = libc::malloc as usize as u64;
        let image = resolver.image_of(ip).expect("malloc lives in some image");
        assert!(!image.path.is_empty());
        assert!(image.base > 0);
        assert!(image.base <= ip);
    }
}
