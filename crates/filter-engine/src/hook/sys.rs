//! Socket helpers shared by the Linux hooks.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use portwarden_core::error::SetupError;

/// Resolves an interface name to its kernel index.
pub(super) fn if_nametoindex(name: &str) -> Result<u32, SetupError> {
    let not_found = || SetupError::InterfaceNotFound {
        name: name.to_owned(),
    };
    let c_name = std::ffi::CString::new(name).map_err(|_| not_found())?;
    // SAFETY: c_name is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(not_found());
    }
    Ok(index)
}

/// Bounds every blocking receive on `fd`, so a receive loop can notice its
/// stop flag.
pub(super) fn set_recv_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: tv is a valid timeval for the given length.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive errors after which the loop simply tries again.
pub(super) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_not_found() {
        let err = if_nametoindex("pw-no-such-if0").unwrap_err();
        assert!(matches!(err, SetupError::InterfaceNotFound { .. }));
    }

    #[test]
    fn interface_name_with_nul_is_not_found() {
        assert!(matches!(
            if_nametoindex("lo\0x"),
            Err(SetupError::InterfaceNotFound { .. })
        ));
    }

    #[test]
    fn timeouts_and_overruns_are_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EINTR)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
