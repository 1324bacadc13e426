//! AF_PACKET transmit sink.
//!
//! One raw socket per worker, bound to the egress interface by index.
//! `send_batch` hands the whole accumulation to the kernel in a single
//! `sendmmsg` call; the kernel copies each accepted payload into socket
//! buffers before returning, so callers may free frames immediately.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use anyhow::{bail, Context, Result};
use upe_core::packet::MacAddr;
use upe_core::TxSink;

/// Upper bound on frames per `sendmmsg`; comfortably above the worker
/// burst size.
const TX_BATCH_MAX: usize = 64;

/// A raw-socket sink bound to one interface.
pub struct AfPacketSink {
    fd: OwnedFd,
    ifindex: u32,
    mac: MacAddr,
}

impl AfPacketSink {
    /// Opens an `AF_PACKET`/`SOCK_RAW` socket on `iface` and reads the
    /// interface MAC.
    pub fn open(iface: &str) -> Result<Self> {
        let name = CString::new(iface).context("interface name contains NUL")?;

        // SAFETY: if_nametoindex only reads the NUL-terminated name.
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            bail!("unknown interface: {iface}");
        }

        // SAFETY: plain socket(2); ownership is transferred to OwnedFd on
        // success.
        let raw_fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from((libc::ETH_P_ALL as u16).to_be()),
            )
        };
        if raw_fd < 0 {
            return Err(io::Error::last_os_error())
                .context("socket(AF_PACKET, SOCK_RAW) failed (requires CAP_NET_RAW)");
        }
        // SAFETY: raw_fd is a fresh, valid descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let mac = interface_mac(&fd, &name)?;

        tracing::info!(iface, ifindex, %mac, "TX sink ready");
        Ok(Self { fd, ifindex, mac })
    }

    /// Interface index this sink transmits on.
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }
}

impl TxSink for AfPacketSink {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn send_batch(&mut self, frames: &[&[u8]]) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let count = frames.len().min(TX_BATCH_MAX);

        // One link-layer destination reused for every message; the frames
        // already carry their Ethernet headers.
        // SAFETY: zeroed sockaddr_ll is a valid all-default template.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        #[allow(clippy::cast_possible_wrap)] // kernel ifindex fits i32
        {
            addr.sll_ifindex = self.ifindex as i32;
        }
        addr.sll_halen = 6;

        // SAFETY: zeroed iovec/mmsghdr arrays are fully overwritten below
        // for the first `count` entries, the only ones passed to the
        // kernel.
        let mut iovecs: [libc::iovec; TX_BATCH_MAX] = unsafe { mem::zeroed() };
        let mut msgs: [libc::mmsghdr; TX_BATCH_MAX] = unsafe { mem::zeroed() };

        for (i, frame) in frames.iter().take(count).enumerate() {
            iovecs[i].iov_base = frame.as_ptr().cast_mut().cast();
            iovecs[i].iov_len = frame.len();
            msgs[i].msg_hdr.msg_name = std::ptr::addr_of_mut!(addr).cast();
            #[allow(clippy::cast_possible_truncation)] // sockaddr_ll is tiny
            {
                msgs[i].msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as u32;
            }
            msgs[i].msg_hdr.msg_iov = &mut iovecs[i];
            msgs[i].msg_hdr.msg_iovlen = 1;
        }

        // SAFETY: msgs/iovecs/addr outlive the call; the kernel consumes
        // accepted payloads before returning. sendmmsg stops at the first
        // failure, so the return is the accepted prefix length.
        #[allow(clippy::cast_possible_truncation)] // count <= TX_BATCH_MAX
        let sent = unsafe { libc::sendmmsg(self.fd.as_raw_fd(), msgs.as_mut_ptr(), count as u32, 0) };
        if sent < 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "sendmmsg failed");
            return 0;
        }
        #[allow(clippy::cast_sign_loss)] // checked non-negative above
        {
            sent as usize
        }
    }
}

/// Reads the interface hardware address via SIOCGIFHWADDR.
fn interface_mac(fd: &OwnedFd, name: &CString) -> Result<MacAddr> {
    // SAFETY: ifreq is zeroed and the name copy is bounds-checked against
    // IFNAMSIZ; the ioctl writes the union in place.
    unsafe {
        let mut ifr: libc::ifreq = mem::zeroed();
        let bytes = name.as_bytes_with_nul();
        if bytes.len() > ifr.ifr_name.len() {
            bail!("interface name too long");
        }
        for (dst, &src) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }

        if libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFHWADDR, &mut ifr) < 0 {
            return Err(io::Error::last_os_error()).context("ioctl(SIOCGIFHWADDR) failed");
        }

        let sa_data = ifr.ifr_ifru.ifru_hwaddr.sa_data;
        let mut mac = [0u8; 6];
        for (dst, &src) in mac.iter_mut().zip(&sa_data[..6]) {
            *dst = src as u8;
        }
        Ok(MacAddr(mac))
    }
}
