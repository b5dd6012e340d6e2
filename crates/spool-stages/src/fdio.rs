use std::{io, os::fd::RawFd};

/// Keep read(2)-ing until `buf` is full or EOF. Returns the bytes
/// actually read; short means EOF.
pub(crate) fn read_full(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
            )
        };
        match n {
            0 => break,
            n if n < 0 => return Err(io::Error::last_os_error()),
            n => got += n as usize,
        }
    }
    Ok(got)
}

/// Keep write(2)-ing until everything is out. A zero-byte write is
/// reported as WriteZero.
pub(crate) fn write_full(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = unsafe {
            libc::write(fd, buf[done..].as_ptr() as *const libc::c_void, buf.len() - done)
        };
        match n {
            0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            n if n < 0 => return Err(io::Error::last_os_error()),
            n => done += n as usize,
        }
    }
    Ok(())
}
