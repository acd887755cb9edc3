use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::net::if_::if_nametoindex;
use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;

use crate::core::addr::AddrMask;
use crate::core::config::NetworkConfig;
use crate::platform::linux::firewall::{self, FirewallRule};
use crate::platform::linux::netlink::{
    NetlinkError, NetlinkRequest, NetlinkSocket, IFA_ADDRESS, IFA_BROADCAST, IFA_LOCAL,
    IFLA_IFNAME, IFLA_INFO_DATA, IFLA_INFO_KIND, IFLA_LINKINFO, IFLA_NET_NS_FD, RTA_GATEWAY,
    VETH_INFO_PEER,
};

/// Wire the network namespace of `pid` to the host.
///
/// Creates a veth pair, migrates the peer into the namespace, addresses and
/// raises both ends, installs a default route inside, and opens egress on
/// the host (ip_forward, masquerade, forward accepts). Any kernel rejection
/// aborts the whole sequence; partially created interface state is left for
/// the caller to treat as a fatal launch failure.
pub fn prepare_network(pid: Pid, config: &NetworkConfig) -> Result<()> {
    let mut sock = NetlinkSocket::open().context("failed to open netlink socket")?;

    sock.request(veth_create_request(&config.host_link, &config.ns_link)?)
        .with_context(|| {
            format!(
                "failed to create veth pair {}/{}",
                config.host_link, config.ns_link
            )
        })?;

    let ns = netns_handle(pid)?;
    sock.request(move_link_request(&config.ns_link, ns.as_raw_fd())?)
        .with_context(|| {
            format!(
                "failed to move {} into the network namespace of pid {pid}",
                config.ns_link
            )
        })?;

    let host_index = if_nametoindex(config.host_link.as_str())
        .with_context(|| format!("no interface named {}", config.host_link))?;
    sock.request(address_request(host_index, &config.host_addr)?)
        .with_context(|| format!("failed to address {}", config.host_link))?;
    sock.request(link_up_request(&config.host_link)?)
        .with_context(|| format!("failed to bring up {}", config.host_link))?;

    configure_namespace_side(&ns, config)?;

    firewall::enable_ipv4_forwarding()?;
    FirewallRule::masquerade(&config.ns_addr.network())
        .apply()
        .context("failed to install the masquerade rule")?;
    FirewallRule::forward_from(&config.host_link)
        .apply()
        .context("failed to allow forwarding from the veth")?;
    FirewallRule::forward_to(&config.host_link)
        .apply()
        .context("failed to allow forwarding to the veth")?;

    Ok(())
}

/// Configure the peer from inside the target namespace: loopback and peer
/// up, peer addressed, default route through the host end.
fn configure_namespace_side(ns: &File, config: &NetworkConfig) -> Result<()> {
    let _guard = NetnsGuard::enter(ns)?;

    let mut sock =
        NetlinkSocket::open().context("failed to open netlink socket inside the namespace")?;

    sock.request(link_up_request("lo")?)
        .context("failed to bring up loopback")?;

    let index = if_nametoindex(config.ns_link.as_str())
        .with_context(|| format!("{} did not arrive in the namespace", config.ns_link))?;
    sock.request(address_request(index, &config.ns_addr)?)
        .with_context(|| format!("failed to address {}", config.ns_link))?;
    sock.request(link_up_request(&config.ns_link)?)
        .with_context(|| format!("failed to bring up {}", config.ns_link))?;

    sock.request(default_route_request(&config.host_addr)?)
        .context("failed to install the default route")?;

    Ok(())
}

/// Open the network-namespace handle of `pid`.
fn netns_handle(pid: Pid) -> Result<File> {
    let path = format!("/proc/{pid}/ns/net");
    File::open(&path).with_context(|| format!("failed to open {path}"))
}

/// Scoped entry into another network namespace. Restores the host
/// namespace on drop, on every path.
struct NetnsGuard {
    host: File,
}

impl NetnsGuard {
    fn enter(target: &File) -> Result<Self> {
        let host = File::open("/proc/self/ns/net")
            .context("failed to open the current network namespace")?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .context("failed to enter the target network namespace")?;
        Ok(Self { host })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.host.as_fd(), CloneFlags::CLONE_NEWNET) {
            // Nothing to recover here; the process is in the wrong
            // namespace and later operations will fail loudly.
            eprintln!("isorun: failed to restore the host network namespace: {e}");
        }
    }
}

fn request_flags() -> u16 {
    (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16
}

/// Link-creation request for a veth device with a named peer.
fn veth_create_request(name: &str, peer: &str) -> Result<NetlinkRequest, NetlinkError> {
    let flags = request_flags() | (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16;
    let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, flags, 0, 0);

    req.append_str(IFLA_IFNAME, name)?;

    let linkinfo = req.begin_nested(IFLA_LINKINFO)?;
    req.append_str(IFLA_INFO_KIND, "veth")?;
    let data = req.begin_nested(IFLA_INFO_DATA)?;
    let peer_nest = req.begin_nested(VETH_INFO_PEER)?;
    // The peer nest carries its own ifinfomsg ahead of its attributes.
    req.append_payload(&[0u8; 16])?;
    req.append_str(IFLA_IFNAME, peer)?;
    req.end_nested(peer_nest);
    req.end_nested(data);
    req.end_nested(linkinfo);

    Ok(req)
}

/// Reassign the named interface into the namespace behind `ns_fd`.
fn move_link_request(name: &str, ns_fd: RawFd) -> Result<NetlinkRequest, NetlinkError> {
    let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, request_flags(), 0, 0);
    req.append_str(IFLA_IFNAME, name)?;
    req.append_bytes(IFLA_NET_NS_FD, &(ns_fd as u32).to_ne_bytes())?;
    Ok(req)
}

/// Raise the named interface's IFF_UP flag.
fn link_up_request(name: &str) -> Result<NetlinkRequest, NetlinkError> {
    let up = libc::IFF_UP as u32;
    let mut req = NetlinkRequest::link(libc::RTM_NEWLINK, request_flags(), up, up);
    req.append_str(IFLA_IFNAME, name)?;
    Ok(req)
}

/// Assign `addr` to the device at `index`.
fn address_request(index: libc::c_uint, addr: &AddrMask) -> Result<NetlinkRequest, NetlinkError> {
    let flags = request_flags() | (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16;
    let mut req = NetlinkRequest::address(libc::RTM_NEWADDR, flags, addr.prefix_len(), index);
    req.append_bytes(IFA_LOCAL, &addr.octets())?;
    req.append_bytes(IFA_ADDRESS, &addr.octets())?;
    req.append_bytes(IFA_BROADCAST, &addr.broadcast_octets())?;
    Ok(req)
}

/// Default route through `gateway`, for the namespace side.
fn default_route_request(gateway: &AddrMask) -> Result<NetlinkRequest, NetlinkError> {
    let flags = request_flags() | libc::NLM_F_CREATE as u16;
    let mut req = NetlinkRequest::route(libc::RTM_NEWROUTE, flags);
    req.append_bytes(RTA_GATEWAY, &gateway.octets())?;
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::linux::netlink::parse_attrs;

    const NLMSG_HDRLEN: usize = 16;

    fn attrs_of(req: &NetlinkRequest, body_len: usize) -> Vec<(u16, Vec<u8>)> {
        parse_attrs(&req.as_bytes()[NLMSG_HDRLEN + body_len..])
    }

    #[test]
    fn veth_create_nests_the_peer() {
        let req = veth_create_request("veth0", "ceth0").unwrap();
        let b = req.as_bytes();

        assert_eq!(u16::from_ne_bytes([b[4], b[5]]), libc::RTM_NEWLINK);
        let flags = u16::from_ne_bytes([b[6], b[7]]);
        assert_ne!(flags & libc::NLM_F_CREATE as u16, 0);
        assert_ne!(flags & libc::NLM_F_EXCL as u16, 0);

        let attrs = attrs_of(&req, 16);
        assert_eq!(attrs[0], (IFLA_IFNAME, b"veth0\0".to_vec()));

        let (kind, linkinfo) = &attrs[1];
        assert_eq!(*kind, IFLA_LINKINFO);
        let info = parse_attrs(linkinfo);
        assert_eq!(info[0], (IFLA_INFO_KIND, b"veth\0".to_vec()));

        let (kind, data) = &info[1];
        assert_eq!(*kind, IFLA_INFO_DATA);
        let peer = parse_attrs(data);
        assert_eq!(peer.len(), 1);
        assert_eq!(peer[0].0, VETH_INFO_PEER);

        // Inside the peer nest: a zeroed ifinfomsg, then the peer name.
        let peer_body = &peer[0].1;
        assert_eq!(&peer_body[..16], &[0u8; 16]);
        let peer_attrs = parse_attrs(&peer_body[16..]);
        assert_eq!(peer_attrs, vec![(IFLA_IFNAME, b"ceth0\0".to_vec())]);
    }

    #[test]
    fn move_request_names_link_and_namespace_fd() {
        let req = move_link_request("ceth0", 9).unwrap();
        let attrs = attrs_of(&req, 16);
        assert_eq!(
            attrs,
            vec![
                (IFLA_IFNAME, b"ceth0\0".to_vec()),
                (IFLA_NET_NS_FD, 9u32.to_ne_bytes().to_vec()),
            ]
        );
    }

    #[test]
    fn link_up_sets_flag_and_change_mask() {
        let req = link_up_request("lo").unwrap();
        let b = req.as_bytes();
        let dev_flags = u32::from_ne_bytes([b[24], b[25], b[26], b[27]]);
        let change = u32::from_ne_bytes([b[28], b[29], b[30], b[31]]);
        assert_eq!(dev_flags, libc::IFF_UP as u32);
        assert_eq!(change, libc::IFF_UP as u32);
    }

    #[test]
    fn address_request_carries_local_and_broadcast() {
        let addr: AddrMask = "10.0.0.2/24".parse().unwrap();
        let req = address_request(5, &addr).unwrap();
        let b = req.as_bytes();
        assert_eq!(b[17], 24); // prefix length in the ifaddrmsg body

        let attrs = attrs_of(&req, 8);
        assert_eq!(
            attrs,
            vec![
                (IFA_LOCAL, vec![10, 0, 0, 2]),
                (IFA_ADDRESS, vec![10, 0, 0, 2]),
                (IFA_BROADCAST, vec![10, 0, 0, 255]),
            ]
        );
    }

    #[test]
    fn default_route_points_at_the_gateway() {
        let gw: AddrMask = "10.0.0.1/24".parse().unwrap();
        let req = default_route_request(&gw).unwrap();
        let attrs = attrs_of(&req, 12);
        assert_eq!(attrs, vec![(RTA_GATEWAY, vec![10, 0, 0, 1])]);
    }
}
