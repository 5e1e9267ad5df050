//! Raw socket-option and message plumbing the portable socket APIs do not
//! expose: buffer sizing, kernel zero-copy, TX/RX timestamping, and the
//! error-queue notification drain.

use std::io;
#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
use std::{io::IoSlice, mem, time::Duration};

#[cfg(target_os = "linux")]
use crate::notify::{
    Notification, TxTimestamp, TxTimestampKind, ZeroCopyDisposition, ZeroCopyNotice,
};
#[cfg(not(target_os = "linux"))]
use crate::notify::Notification;
use crate::error::Error;

#[cfg(unix)]
pub fn set_buffer_sizes(fd: RawFd, send: Option<usize>, receive: Option<usize>) {
    unsafe {
        if let Some(size) = send {
            let size = size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&raw const size).cast(),
                mem_size_of_c_int(),
            );
        }
        if let Some(size) = receive {
            let size = size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                (&raw const size).cast(),
                mem_size_of_c_int(),
            );
        }
    }
}

#[cfg(unix)]
fn mem_size_of_c_int() -> libc::socklen_t {
    core::mem::size_of::<libc::c_int>() as libc::socklen_t
}

/// Current kernel send buffer size (`SO_SNDBUF`).
#[cfg(unix)]
pub fn send_buffer_size(fd: RawFd) -> io::Result<usize> {
    let mut size: libc::c_int = 0;
    let mut len = mem_size_of_c_int();
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, (&raw mut size).cast(), &raw mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size as usize)
}

// Error-queue constants from the linux uapi; spelled out here because the
// libc crate's coverage of them has been uneven.
#[cfg(target_os = "linux")]
const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
#[cfg(target_os = "linux")]
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
#[cfg(target_os = "linux")]
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

#[cfg(target_os = "linux")]
const SCM_TSTAMP_SND: u32 = 0;
#[cfg(target_os = "linux")]
const SCM_TSTAMP_SCHED: u32 = 1;
#[cfg(target_os = "linux")]
const SCM_TSTAMP_ACK: u32 = 2;

#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_TX_SOFTWARE: libc::c_int = 1 << 1;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_int = 1 << 3;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_SOFTWARE: libc::c_int = 1 << 4;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_OPT_ID: libc::c_int = 1 << 7;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_TX_SCHED: libc::c_int = 1 << 8;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_TX_ACK: libc::c_int = 1 << 9;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_OPT_TSONLY: libc::c_int = 1 << 11;

/// Allow `MSG_ZEROCOPY` sends on this socket.
#[cfg(target_os = "linux")]
pub fn enable_zero_copy(fd: RawFd) -> Result<(), Error> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ZEROCOPY,
            (&raw const one).cast(),
            mem_size_of_c_int(),
        )
    };
    if rc != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_zero_copy(_fd: RawFd) -> Result<(), Error> {
    Err(Error::NotImplemented)
}

/// Scatter-gather send with `MSG_ZEROCOPY`.
#[cfg(target_os = "linux")]
pub fn send_zero_copy(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = bufs.len() as _;
    let rc = unsafe { libc::sendmsg(fd, &msg, libc::MSG_ZEROCOPY | libc::MSG_NOSIGNAL) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

#[cfg(not(target_os = "linux"))]
pub fn send_zero_copy(_fd: RawFd, _bufs: &[std::io::IoSlice<'_>]) -> io::Result<usize> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Enable software TX timestamping with byte-counter ids.
#[cfg(target_os = "linux")]
pub fn enable_tx_timestamping(fd: RawFd) -> Result<(), Error> {
    let flags: libc::c_int = SOF_TIMESTAMPING_TX_SCHED
        | SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_TX_ACK
        | SOF_TIMESTAMPING_SOFTWARE
        | SOF_TIMESTAMPING_OPT_ID
        | SOF_TIMESTAMPING_OPT_TSONLY;
    set_timestamping(fd, flags)
}

/// Enable software RX timestamping.
#[cfg(target_os = "linux")]
pub fn enable_rx_timestamping(fd: RawFd) -> Result<(), Error> {
    set_timestamping(fd, SOF_TIMESTAMPING_RX_SOFTWARE | SOF_TIMESTAMPING_SOFTWARE)
}

#[cfg(target_os = "linux")]
fn set_timestamping(fd: RawFd, flags: libc::c_int) -> Result<(), Error> {
    // Merge with whatever direction is already enabled.
    let mut current: libc::c_int = 0;
    let mut len = mem_size_of_c_int();
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            (&raw mut current).cast(),
            &raw mut len,
        );
    }
    let merged = current | flags;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            (&raw const merged).cast(),
            mem_size_of_c_int(),
        )
    };
    if rc != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_tx_timestamping(_fd: RawFd) -> Result<(), Error> {
    Err(Error::NotImplemented)
}

#[cfg(not(target_os = "linux"))]
pub fn enable_rx_timestamping(_fd: RawFd) -> Result<(), Error> {
    Err(Error::NotImplemented)
}

/// Receive into `buf`, also extracting the kernel RX timestamp when one is
/// attached. Used instead of a plain read while RX timestamping is enabled.
#[cfg(target_os = "linux")]
pub fn recv_with_timestamp(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, Option<std::time::SystemTime>)> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };
    let mut control = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    let rc = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut stamp = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_TIMESTAMPING {
            let ts = unsafe { &*(libc::CMSG_DATA(cmsg).cast::<[libc::timespec; 3]>()) };
            if ts[0].tv_sec != 0 || ts[0].tv_nsec != 0 {
                let elapsed = Duration::new(ts[0].tv_sec as u64, ts[0].tv_nsec as u32);
                stamp = Some(std::time::UNIX_EPOCH + elapsed);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }
    Ok((rc as usize, stamp))
}

#[cfg(not(target_os = "linux"))]
pub fn recv_with_timestamp(
    _fd: RawFd,
    _buf: &mut [u8],
) -> io::Result<(usize, Option<std::time::SystemTime>)> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Drain the socket error queue into zero-copy and timestamp notifications.
/// Non-notification payloads are left for `SO_ERROR` retrieval.
#[cfg(target_os = "linux")]
pub fn drain_error_queue(fd: RawFd) -> Vec<Notification> {
    let mut notifications = Vec::new();
    loop {
        let mut control = [0u8; 512];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len() as _;

        let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
        if rc < 0 {
            break;
        }

        let mut stamp: Option<Duration> = None;
        let mut key: Option<(TxTimestampKind, u32)> = None;

        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let header = unsafe { &*cmsg };
            if header.cmsg_level == libc::SOL_SOCKET
                && header.cmsg_type == libc::SCM_TIMESTAMPING
            {
                let ts = unsafe { &*(libc::CMSG_DATA(cmsg).cast::<[libc::timespec; 3]>()) };
                stamp = Some(Duration::new(ts[0].tv_sec as u64, ts[0].tv_nsec as u32));
            } else if (header.cmsg_level == libc::SOL_IP && header.cmsg_type == libc::IP_RECVERR)
                || (header.cmsg_level == libc::SOL_IPV6 && header.cmsg_type == libc::IPV6_RECVERR)
            {
                let err = unsafe { &*(libc::CMSG_DATA(cmsg).cast::<libc::sock_extended_err>()) };
                match err.ee_origin {
                    SO_EE_ORIGIN_ZEROCOPY => {
                        let disposition = if err.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0 {
                            ZeroCopyDisposition::Copied
                        } else {
                            ZeroCopyDisposition::Avoided
                        };
                        notifications.push(Notification::ZeroCopy(ZeroCopyNotice {
                            from: err.ee_info,
                            thru: err.ee_data,
                            disposition,
                        }));
                    }
                    SO_EE_ORIGIN_TIMESTAMPING => {
                        let kind = match err.ee_info {
                            SCM_TSTAMP_SCHED => TxTimestampKind::Scheduled,
                            SCM_TSTAMP_SND => TxTimestampKind::Sent,
                            SCM_TSTAMP_ACK => TxTimestampKind::Acknowledged,
                            _ => {
                                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
                                continue;
                            }
                        };
                        key = Some((kind, err.ee_data));
                    }
                    _ => {}
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        if let (Some(stamp), Some((kind, id))) = (stamp, key) {
            notifications.push(Notification::Timestamp(TxTimestamp {
                kind,
                id,
                time: std::time::UNIX_EPOCH + stamp,
            }));
        }
    }
    notifications
}

#[cfg(not(target_os = "linux"))]
pub fn drain_error_queue(_fd: RawFd) -> Vec<Notification> {
    Vec::new()
}
