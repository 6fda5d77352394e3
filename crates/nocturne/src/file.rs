// src/file.rs
//! Static resource resolution and read-only file mapping.
use crate::http::{StatusCode, content_type_for};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;

/// A read-only private mapping of a whole file. Unmapped exactly once, on drop.
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is read-only and owned by this value alone.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map `len` bytes of `file`. `len` must be non-zero.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file"));
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

/// A resolved, readable regular file ready to be sent.
#[derive(Debug)]
pub struct Resource {
    pub content_type: &'static str,
    /// `None` for an empty file.
    pub map: Option<MappedFile>,
}

/// Document root that request paths resolve against.
#[derive(Debug, Clone)]
pub struct StaticRoot {
    root: PathBuf,
    index_file: String,
}

impl StaticRoot {
    pub fn new(root: impl Into<PathBuf>, index_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index_file: index_file.into(),
        }
    }

    /// Map a request path to a file on disk, or to the failure status.
    pub fn resolve(&self, request_path: &str) -> Result<Resource, StatusCode> {
        let relative = request_path.trim_start_matches('/');
        let relative = if relative.is_empty() {
            self.index_file.as_str()
        } else {
            relative
        };

        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StatusCode::Forbidden);
        }

        let path = self.root.join(relative);
        let meta = std::fs::metadata(&path).map_err(|e| status_for_io(&e))?;

        if meta.is_dir() {
            return Err(StatusCode::Forbidden);
        }
        // World-readable regular files only.
        if !meta.is_file() || meta.permissions().mode() & 0o004 == 0 {
            return Err(StatusCode::Forbidden);
        }

        let file = File::open(&path).map_err(|e| status_for_io(&e))?;
        let len = usize::try_from(meta.len()).map_err(|_| StatusCode::InternalError)?;
        let map = if len == 0 {
            None
        } else {
            Some(MappedFile::map(&file, len).map_err(|e| {
                tracing::warn!(path = %path.display(), error = %e, "mmap failed");
                StatusCode::InternalError
            })?)
        };

        Ok(Resource {
            content_type: content_type_for(&path),
            map,
        })
    }
}

fn status_for_io(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ if err.raw_os_error() == Some(libc::ENOTDIR) => StatusCode::NotFound,
        _ => StatusCode::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn site() -> (tempfile::TempDir, StaticRoot) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("empty.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let secret = dir.path().join("secret.txt");
        fs::write(&secret, b"hidden").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
        let root = StaticRoot::new(dir.path(), "index.html");
        (dir, root)
    }

    #[test]
    fn test_resolve_found_maps_exact_bytes() {
        let (_dir, root) = site();
        let res = root.resolve("/a.txt").unwrap();
        assert_eq!(res.map.as_ref().unwrap().as_slice(), b"hello");
        assert_eq!(res.content_type, "text/plain; charset=utf-8");
    }

    #[test]
    fn test_resolve_index_for_root() {
        let (_dir, root) = site();
        let res = root.resolve("/").unwrap();
        assert_eq!(res.map.unwrap().as_slice(), b"<h1>home</h1>");
    }

    #[test]
    fn test_resolve_failures() {
        let (_dir, root) = site();
        assert_eq!(root.resolve("/missing.txt").unwrap_err(), StatusCode::NotFound);
        assert_eq!(root.resolve("/a.txt/deeper").unwrap_err(), StatusCode::NotFound);
        assert_eq!(root.resolve("/sub").unwrap_err(), StatusCode::Forbidden);
        assert_eq!(root.resolve("/secret.txt").unwrap_err(), StatusCode::Forbidden);
        assert_eq!(root.resolve("/../etc/passwd").unwrap_err(), StatusCode::Forbidden);
    }

    #[test]
    fn test_resolve_empty_file_has_no_mapping() {
        let (_dir, root) = site();
        let res = root.resolve("/empty.txt").unwrap();
        assert!(res.map.is_none());
    }
}
