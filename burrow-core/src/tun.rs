//! TUN device helpers.
//!
//! The platform hands over a raw file descriptor it still owns; the helper
//! duplicates it so the returned `File` can be closed independently. The
//! input pump is deliberately synchronous: TUN reads come from a dedicated
//! platform thread.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tunnel::Tunnel;

/// Interface MTU assumed for TUN packet reads.
pub const VPN_MTU: usize = 1500;

/// Wrap a TUN file descriptor without taking ownership: the descriptor is
/// duplicated, so closing the returned `File` leaves the caller's fd open.
#[cfg(unix)]
pub fn make_tun_file(fd: std::os::fd::RawFd) -> Result<File> {
    use std::os::fd::BorrowedFd;

    if fd < 0 {
        return Err(Error::config("must provide a valid TUN file descriptor"));
    }
    // Safety: the caller guarantees `fd` stays open for the duration of
    // this call; the clone has its own lifetime afterwards.
    let owned = unsafe { BorrowedFd::borrow_raw(fd) }
        .try_clone_to_owned()
        .map_err(Error::Io)?;
    Ok(File::from(owned))
}

/// Copy packets from the TUN device into the tunnel until it disconnects.
pub fn pump_input<R: Read>(tunnel: &Arc<Tunnel>, tun: &mut R) {
    let mut buffer = [0u8; VPN_MTU];
    while tunnel.is_connected() {
        match tun.read(&mut buffer) {
            Ok(0) => {
                debug!("read EOF from TUN");
                break;
            }
            Ok(n) => {
                if let Err(e) = tunnel.write(&buffer[..n]) {
                    warn!(error = %e, "stack rejected TUN packet");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read packet from TUN");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn closing_the_clone_leaves_the_original_open() {
        let path = std::env::temp_dir().join(format!("burrow-tun-{}", std::process::id()));
        let mut original = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        let clone = make_tun_file(original.as_raw_fd()).unwrap();
        drop(clone);

        // The original descriptor must still work.
        original.write_all(b"still alive").unwrap();
        original.seek(SeekFrom::Start(0)).unwrap();
        let mut read_back = String::new();
        original.read_to_string(&mut read_back).unwrap();
        assert_eq!(read_back, "still alive");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn negative_fd_is_rejected() {
        assert!(make_tun_file(-1).is_err());
    }
}
