use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};
use thiserror::Error;

/// Fixed netlink message header length.
const NLMSG_HDRLEN: usize = 16;
/// Capacity reserved for appended attributes in one request.
const ATTR_CAPACITY: usize = 1024;
/// Receive buffer size for kernel replies.
const REPLY_BUF: usize = 4096;

// Attribute constants from <linux/if_link.h>, <linux/veth.h>,
// <linux/if_addr.h> and <linux/rtnetlink.h> that the libc crate does not
// export.
/// Interface name, null-terminated string.
pub const IFLA_IFNAME: u16 = 3;
/// Nest holding the link kind and kind-specific data.
pub const IFLA_LINKINFO: u16 = 18;
/// Target network namespace as an open fd.
pub const IFLA_NET_NS_FD: u16 = 28;
/// Link kind string inside IFLA_LINKINFO.
pub const IFLA_INFO_KIND: u16 = 1;
/// Kind-specific payload inside IFLA_LINKINFO.
pub const IFLA_INFO_DATA: u16 = 2;
/// Peer device description inside a veth IFLA_INFO_DATA.
pub const VETH_INFO_PEER: u16 = 1;
/// Interface address.
pub const IFA_ADDRESS: u16 = 1;
/// Local interface address.
pub const IFA_LOCAL: u16 = 2;
/// Broadcast address.
pub const IFA_BROADCAST: u16 = 4;
/// Route gateway address.
pub const RTA_GATEWAY: u16 = 5;

// rtmsg field values from <linux/rtnetlink.h>.
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

/// Errors from building or exchanging netlink messages.
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("request grew past its {0}-byte attribute buffer")]
    MessageOverflow(usize),
    #[error("netlink I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel rejected the request: {0}")]
    Kernel(Errno),
    #[error("short reply from kernel ({0} bytes)")]
    TruncatedReply(usize),
    #[error("unexpected reply message type {0:#x}")]
    UnexpectedReply(u16),
}

/// A routing-netlink request under construction: one message header, a
/// type-specific body, and appended attributes.
///
/// The header's length field is re-synced after every append, so the buffer
/// is sendable at any point. Appends past [`ATTR_CAPACITY`] fail with
/// [`NetlinkError::MessageOverflow`] instead of truncating.
pub struct NetlinkRequest {
    buf: Vec<u8>,
    limit: usize,
}

impl NetlinkRequest {
    fn with_body(msg_type: u16, flags: u16, body: &[u8]) -> Self {
        let limit = NLMSG_HDRLEN + body.len() + ATTR_CAPACITY;
        let mut buf = Vec::with_capacity(limit);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, synced below
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq, set on send
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid, kernel fills ours
        buf.extend_from_slice(body);

        let mut req = Self { buf, limit };
        req.sync_len();
        req
    }

    /// A link request: `ifinfomsg` body with the given device flags and
    /// change mask. The device index stays zero; targets are named through
    /// an `IFLA_IFNAME` attribute.
    pub fn link(msg_type: u16, flags: u16, dev_flags: u32, change: u32) -> Self {
        let mut body = [0u8; 16];
        body[0] = libc::AF_UNSPEC as u8;
        body[8..12].copy_from_slice(&dev_flags.to_ne_bytes());
        body[12..16].copy_from_slice(&change.to_ne_bytes());
        Self::with_body(msg_type, flags, &body)
    }

    /// An IPv4 address request: `ifaddrmsg` body for the given device index.
    pub fn address(msg_type: u16, flags: u16, prefix_len: u8, index: u32) -> Self {
        let mut body = [0u8; 8];
        body[0] = libc::AF_INET as u8;
        body[1] = prefix_len;
        body[3] = RT_SCOPE_UNIVERSE;
        body[4..8].copy_from_slice(&index.to_ne_bytes());
        Self::with_body(msg_type, flags, &body)
    }

    /// An IPv4 unicast route request: `rtmsg` body for the main table.
    pub fn route(msg_type: u16, flags: u16) -> Self {
        let mut body = [0u8; 12];
        body[0] = libc::AF_INET as u8;
        body[4] = RT_TABLE_MAIN;
        body[5] = RTPROT_BOOT;
        body[6] = RT_SCOPE_UNIVERSE;
        body[7] = RTN_UNICAST;
        Self::with_body(msg_type, flags, &body)
    }

    /// Append a null-terminated string attribute.
    pub fn append_str(&mut self, kind: u16, value: &str) -> Result<(), NetlinkError> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.append_bytes(kind, &payload)
    }

    /// Append a raw-bytes attribute.
    pub fn append_bytes(&mut self, kind: u16, payload: &[u8]) -> Result<(), NetlinkError> {
        let attr_len = 4 + payload.len();
        self.reserve(align4(attr_len))?;
        self.buf.extend_from_slice(&(attr_len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
        self.sync_len();
        Ok(())
    }

    /// Append raw payload bytes without an attribute header. Needed for the
    /// `ifinfomsg` that leads a veth peer nest.
    pub fn append_payload(&mut self, bytes: &[u8]) -> Result<(), NetlinkError> {
        self.reserve(align4(bytes.len()))?;
        self.buf.extend_from_slice(bytes);
        self.pad();
        self.sync_len();
        Ok(())
    }

    /// Open a nested attribute. The returned token must be handed back to
    /// [`end_nested`] once the nest's contents are appended.
    pub fn begin_nested(&mut self, kind: u16) -> Result<usize, NetlinkError> {
        self.reserve(4)?;
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // patched by end_nested
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.sync_len();
        Ok(start)
    }

    /// Close a nested attribute, patching its length to cover everything
    /// appended since [`begin_nested`].
    pub fn end_nested(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    /// The encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    fn reserve(&mut self, extra: usize) -> Result<(), NetlinkError> {
        if self.buf.len() + extra > self.limit {
            return Err(NetlinkError::MessageOverflow(ATTR_CAPACITY));
        }
        Ok(())
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn sync_len(&mut self) {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// A blocking route-netlink socket.
///
/// One socket serves one configuration sequence; sockets are never shared
/// between launches.
pub struct NetlinkSocket {
    sock: File,
    seq: u32,
}

impl NetlinkSocket {
    /// Open and bind a `NETLINK_ROUTE` socket in the current network
    /// namespace.
    pub fn open() -> Result<Self, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(|e| NetlinkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        bind_local(&fd)?;

        Ok(Self {
            sock: File::from(fd),
            seq: 0,
        })
    }

    /// Send one request and block until the kernel acknowledges it.
    pub fn request(&mut self, req: NetlinkRequest) -> Result<(), NetlinkError> {
        self.send(req)?;
        self.receive()
    }

    /// Transmit a fully built request, stamping it with the next sequence
    /// number.
    pub fn send(&mut self, mut req: NetlinkRequest) -> Result<(), NetlinkError> {
        self.seq = self.seq.wrapping_add(1);
        req.set_seq(self.seq);
        self.sock.write_all(req.as_bytes())?;
        Ok(())
    }

    /// Block for a reply and decode acknowledgement vs. kernel error.
    pub fn receive(&mut self) -> Result<(), NetlinkError> {
        let mut buf = [0u8; REPLY_BUF];
        let n = self.sock.read(&mut buf)?;
        if n < NLMSG_HDRLEN {
            return Err(NetlinkError::TruncatedReply(n));
        }

        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        match i32::from(msg_type) {
            libc::NLMSG_ERROR => {
                if n < NLMSG_HDRLEN + 4 {
                    return Err(NetlinkError::TruncatedReply(n));
                }
                // An NLMSG_ERROR with code zero is the requested ACK.
                let code = i32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]);
                if code == 0 {
                    Ok(())
                } else {
                    Err(NetlinkError::Kernel(Errno::from_raw(-code)))
                }
            }
            libc::NLMSG_DONE => Ok(()),
            _ => Err(NetlinkError::UnexpectedReply(msg_type)),
        }
    }
}

fn bind_local(fd: &OwnedFd) -> Result<(), NetlinkError> {
    // SAFETY: sockaddr_nl is plain data; zeroed is its "unbound" state.
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    // SAFETY: addr is a fully initialized sockaddr_nl owned by this frame.
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NetlinkError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Decode the top-level attributes of an encoded request. Test helper shared
/// with the bridge's request-structure tests.
#[cfg(test)]
pub(crate) fn parse_attrs(mut body: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut attrs = Vec::new();
    while body.len() >= 4 {
        let len = u16::from_ne_bytes([body[0], body[1]]) as usize;
        let kind = u16::from_ne_bytes([body[2], body[3]]);
        assert!(len >= 4 && len <= body.len(), "corrupt attribute length {len}");
        attrs.push((kind, body[4..len].to_vec()));
        body = &body[align4(len).min(body.len())..];
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_len(req: &NetlinkRequest) -> usize {
        let b = req.as_bytes();
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as usize
    }

    #[test]
    fn header_length_tracks_every_append() {
        let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, 0, 0, 0);
        assert_eq!(header_len(&req), NLMSG_HDRLEN + 16);
        assert_eq!(header_len(&req), req.as_bytes().len());

        req.append_str(IFLA_IFNAME, "veth0").unwrap();
        assert_eq!(header_len(&req), req.as_bytes().len());
        assert_eq!(req.as_bytes().len() % 4, 0);

        req.append_bytes(IFLA_NET_NS_FD, &7u32.to_ne_bytes()).unwrap();
        assert_eq!(header_len(&req), req.as_bytes().len());
    }

    #[test]
    fn attributes_round_trip_with_alignment() {
        let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, 0, 0, 0);
        req.append_str(IFLA_IFNAME, "eth9").unwrap(); // 5-byte payload, padded
        req.append_bytes(IFA_LOCAL, &[10, 0, 0, 2]).unwrap();
        req.append_bytes(IFA_BROADCAST, &[10, 0, 0, 255]).unwrap();

        let attrs = parse_attrs(&req.as_bytes()[NLMSG_HDRLEN + 16..]);
        assert_eq!(
            attrs,
            vec![
                (IFLA_IFNAME, b"eth9\0".to_vec()),
                (IFA_LOCAL, vec![10, 0, 0, 2]),
                (IFA_BROADCAST, vec![10, 0, 0, 255]),
            ]
        );
    }

    #[test]
    fn nested_attribute_length_is_patched() {
        let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, 0, 0, 0);
        let nest = req.begin_nested(IFLA_LINKINFO).unwrap();
        req.append_str(IFLA_INFO_KIND, "veth").unwrap();
        req.end_nested(nest);

        let attrs = parse_attrs(&req.as_bytes()[NLMSG_HDRLEN + 16..]);
        assert_eq!(attrs.len(), 1);
        let (kind, payload) = &attrs[0];
        assert_eq!(*kind, IFLA_LINKINFO);

        let inner = parse_attrs(payload);
        assert_eq!(inner, vec![(IFLA_INFO_KIND, b"veth\0".to_vec())]);
    }

    #[test]
    fn overflow_is_an_error_not_a_truncation() {
        let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, 0, 0, 0);
        let big = vec![0u8; 512];
        req.append_bytes(1, &big).unwrap();
        let before = req.as_bytes().len();

        let err = req.append_bytes(2, &big).unwrap_err();
        assert!(matches!(err, NetlinkError::MessageOverflow(_)));
        // The failed append left the buffer untouched.
        assert_eq!(req.as_bytes().len(), before);
        assert_eq!(header_len(&req), before);
    }

    #[test]
    fn message_type_and_flags_are_encoded() {
        let flags = (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16;
        let req = NetlinkRequest::address(libc::RTM_NEWADDR, flags, 24, 3);
        let b = req.as_bytes();
        assert_eq!(u16::from_ne_bytes([b[4], b[5]]), libc::RTM_NEWADDR);
        assert_eq!(u16::from_ne_bytes([b[6], b[7]]), flags);

        // ifaddrmsg: family, prefixlen, flags, scope, index.
        assert_eq!(b[16], libc::AF_INET as u8);
        assert_eq!(b[17], 24);
        assert_eq!(u32::from_ne_bytes([b[20], b[21], b[22], b[23]]), 3);
    }

    #[test]
    fn route_body_targets_the_main_table() {
        let req = NetlinkRequest::route(libc::RTM_NEWROUTE, 0);
        let b = req.as_bytes();
        assert_eq!(b[16], libc::AF_INET as u8);
        assert_eq!(b[20], RT_TABLE_MAIN);
        assert_eq!(b[21], RTPROT_BOOT);
        assert_eq!(b[23], RTN_UNICAST);
    }
}
