use eyre::{
    bail,
    Result,
};
use std::{
    io,
    path::Path,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// Space available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn free_bytes(path: &Path) -> io::Result<u64> {
    use std::{
        ffi::CString,
        os::unix::ffi::OsStrExt as _,
    };

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "free space check needs statvfs"))
}

/// Fails when the filesystem that will hold `dir` has less than `min_gb` free.
pub fn check_free_space(dir: &Path, min_gb: u64, disabled: bool) -> Result<()> {
    if disabled || min_gb == 0 {
        debug!("free space check skipped");
        return Ok(());
    }
    let Some(existing) = dir.ancestors().find(|p| p.exists()) else {
        warn!(dir = %dir.display(), "no existing parent, free space not checked");
        return Ok(());
    };
    let free = match free_bytes(existing) {
        Ok(free) => free,
        Err(err) => {
            warn!(dir = %existing.display(), "free space not checked: {err}");
            return Ok(());
        },
    };
    let needed = min_gb.saturating_mul(GIB);
    debug!(dir = %existing.display(), free_gb = free / GIB, min_gb, "free space");
    if free < needed {
        bail!(
            "only {:.1} GB free under {}, at least {min_gb} GB needed; free up space, lower --min-free-space-gb or pass --disable-free-space-check",
            free as f64 / GIB as f64,
            existing.display()
        );
    }
    Ok(())
}
