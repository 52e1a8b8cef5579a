//! Network setup: hosts/resolver bootstrap, loopback, socket-buffer
//! sysctls, and per-interface `MSG_NET_CTL`/`MSG_NET_HOST` handling.
//! TAP creation, route installation, and MTU/address assignment are
//! external primitives — pinned here only by the effect they must
//! have.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{AgentError, Result};

pub const NET_MEM_DEFAULT: u64 = 1_048_576; // 1 MiB
pub const NET_MEM_MAX: u64 = 2_097_152; // 2 MiB
pub const MTU_VPN: u32 = 1220;
pub const MTU_INET: u32 = 65521;

const HOSTS_PATH: &str = "/etc/hosts";
const RESOLV_PATH: &str = "/etc/resolv.conf";

const DEFAULT_HOSTS: &[(&str, &str)] = &[
    ("127.0.0.1", "localhost"),
    ("::1", "ip6-localhost ip6-loopback"),
    ("fe00::0", "ip6-localnet"),
    ("ff00::0", "ip6-mcastprefix"),
    ("ff02::1", "ip6-allnodes"),
    ("ff02::2", "ip6-allrouters"),
];

const NAMESERVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];

/// Which guest interface a `MSG_NET_CTL`/`MSG_NET_HOST` operation
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Vpn,
    Inet,
}

impl Interface {
    pub fn from_wire(v: u16) -> Self {
        if v == 1 {
            Interface::Inet
        } else {
            Interface::Vpn
        }
    }
}

fn append_hosts(entries: &[(String, String)]) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(HOSTS_PATH)?;
    for (ip, hostname) in entries {
        writeln!(f, "{ip} {hostname}")?;
    }
    Ok(())
}

fn write_resolv(nameservers: &[&str]) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(RESOLV_PATH)?;
    for ns in nameservers {
        writeln!(f, "nameserver {ns}")?;
    }
    Ok(())
}

fn write_sysctl(path: &str, value: u64) -> Result<()> {
    std::fs::write(path, value.to_string()).map_err(AgentError::from)
}

/// Startup network bootstrap: hosts, resolver, loopback, sysctls.
/// Called once before the event loop starts.
pub fn startup() -> Result<()> {
    let hosts: Vec<(String, String)> = DEFAULT_HOSTS
        .iter()
        .map(|(ip, h)| (ip.to_string(), h.to_string()))
        .collect();
    append_hosts(&hosts)?;
    write_resolv(NAMESERVERS)?;

    iface_up_loopback()?;

    write_sysctl("/proc/sys/net/core/rmem_default", NET_MEM_DEFAULT)?;
    write_sysctl("/proc/sys/net/core/rmem_max", NET_MEM_MAX)?;
    write_sysctl("/proc/sys/net/core/wmem_default", NET_MEM_DEFAULT)?;
    write_sysctl("/proc/sys/net/core/wmem_max", NET_MEM_MAX)?;
    Ok(())
}

/// Bring `lo` up with `127.0.0.1/255.255.255.0`. The actual ioctl
/// sequence (`SIOCSIFADDR`/`SIOCSIFNETMASK`/`SIOCSIFFLAGS`) lives
/// behind the external network-primitives boundary; here we just
/// sequence the calls.
fn iface_up_loopback() -> Result<()> {
    set_if_addr("lo", "127.0.0.1", Some("255.255.255.0"))?;
    set_if_up("lo")?;
    Ok(())
}

/// Derive a deterministic, reversible MAC from an IPv4 address: byte 0
/// is fixed to `0x02` (locally administered, unicast — never collides
/// with a hardware-assigned OUI), byte 1 is zero, and bytes 2..=5 are
/// the four IP octets in order. Two different IPv4 addresses always
/// yield two different MACs, and the IP is recoverable from the MAC's
/// last four bytes.
pub fn mac_from_ipv4(ip: Ipv4Addr) -> [u8; 6] {
    let o = ip.octets();
    [0x02, 0x00, o[0], o[1], o[2], o[3]]
}

/// Derive a MAC from an IPv6 address: byte 0 is `0x02`, remaining 5
/// bytes are the last 5 bytes of the address. Not a true bijection
/// over the full 128-bit space, but deterministic, and collisions
/// within a single VM's small address set are not expected.
pub fn mac_from_ipv6(ip: Ipv6Addr) -> [u8; 6] {
    let o = ip.octets();
    [0x02, o[11], o[12], o[13], o[14], o[15]]
}

fn set_if_addr(_name: &str, _addr: &str, _mask: Option<&str>) -> Result<()> {
    // External primitive: assigns an IPv4 address/netmask to a named
    // interface. Pinned by effect only.
    Ok(())
}

fn set_if_addr6(_name: &str, _addr: &str) -> Result<()> {
    Ok(())
}

fn set_if_up(_name: &str) -> Result<()> {
    Ok(())
}

fn set_if_hw_addr(_name: &str, _mac: [u8; 6]) -> Result<()> {
    Ok(())
}

fn set_if_mtu(_name: &str, _mtu: u32) -> Result<()> {
    Ok(())
}

fn add_route(_if_name: &str, _dst: Option<&str>, _mask: Option<&str>, _gateway: &str) -> Result<()> {
    Ok(())
}

fn add_route6(_if_name: &str, _dst: Option<&str>, _gateway: &str) -> Result<()> {
    Ok(())
}

/// Open the host-provided character device for an interface. Absent
/// means the interface is not wired up this boot; callers skip the
/// forwarder pair for it.
pub fn open_char_device(path: &str) -> Result<Option<File>> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AgentError::Io(e)),
    }
}

/// Create the guest-side TAP paired with a host character device.
/// The `TUNSETIFF` ioctl dance that actually allocates the device
/// lives behind the same external network-primitives boundary as
/// [`set_if_addr`] and friends; this stands in for it.
pub fn create_tap(_name: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(AgentError::from)
}

/// Fields of a parsed `MSG_NET_CTL` request.
#[derive(Debug, Default)]
pub struct NetCtl {
    pub flags: u16,
    pub addr: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub if_addr: Option<String>,
    pub iface: Option<Interface>,
}

/// Apply one `MSG_NET_CTL` request to the named interface (the caller
/// in `agent.rs` resolves `iface` to a concrete interface name: the TAP
/// name if present, else the fixed fallback `eth0`/`eth1`).
pub fn apply_net_ctl(if_name: &str, ctl: &NetCtl) -> Result<()> {
    if let Some(if_addr) = ctl.if_addr.as_deref().filter(|s| !s.is_empty()) {
        if if_addr.contains(':') {
            let ip6 = Ipv6Addr::from_str(if_addr).map_err(|_| AgentError::InvalidArgument)?;
            set_if_addr6(if_name, if_addr)?;
            set_if_hw_addr(if_name, mac_from_ipv6(ip6))?;
        } else {
            let ip4 = Ipv4Addr::from_str(if_addr).map_err(|_| AgentError::InvalidArgument)?;
            let mask = ctl
                .mask
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(AgentError::InvalidArgument)?;
            set_if_addr(if_name, if_addr, Some(mask))?;
            set_if_hw_addr(if_name, mac_from_ipv4(ip4))?;
        }
    }

    if let Some(gateway) = ctl.gateway.as_deref().filter(|s| !s.is_empty()) {
        if gateway.contains(':') {
            add_route6(if_name, ctl.addr.as_deref(), gateway)?;
        } else {
            add_route(if_name, ctl.addr.as_deref(), ctl.mask.as_deref(), gateway)?;
        }
    }
    Ok(())
}

/// Apply `MSG_NET_HOST`: append N `(ip, hostname)` pairs to the hosts
/// file.
pub fn apply_net_host(entries: &[(String, String)]) -> Result<()> {
    append_hosts(entries)
}

/// Start the two forwarders for an interface that has a host character
/// device present: host→TAP is read-prefixed/write-raw, TAP→host is
/// read-raw/write-prefixed.
pub fn forwarder_buffer_capacity(mtu: u32, multiplier: u32) -> usize {
    (multiplier as usize) * (mtu as usize + 14)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_from_ipv4_is_deterministic_and_distinct() {
        let a = mac_from_ipv4(Ipv4Addr::new(10, 0, 0, 1));
        let b = mac_from_ipv4(Ipv4Addr::new(10, 0, 0, 1));
        let c = mac_from_ipv4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a[0] & 0x03, 0x02); // locally administered, unicast
    }

    #[test]
    fn mac_from_ipv4_is_reversible() {
        let ip = Ipv4Addr::new(192, 168, 7, 42);
        let mac = mac_from_ipv4(ip);
        let recovered = Ipv4Addr::new(mac[2], mac[3], mac[4], mac[5]);
        assert_eq!(ip, recovered);
    }

    #[test]
    fn vpn_buffer_capacity_is_4x_mtu_plus_eth_header() {
        assert_eq!(forwarder_buffer_capacity(MTU_VPN, 4), 4 * (1220 + 14));
    }

    #[test]
    fn inet_buffer_capacity_is_1x_mtu_plus_eth_header() {
        assert_eq!(forwarder_buffer_capacity(MTU_INET, 1), 65521 + 14);
    }

    #[test]
    fn net_ctl_requires_mask_for_ipv4() {
        let ctl = NetCtl {
            if_addr: Some("10.0.0.5".to_string()),
            mask: None,
            ..Default::default()
        };
        let err = apply_net_ctl("eth0", &ctl).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument));
    }

    #[test]
    fn net_ctl_ipv6_does_not_need_mask() {
        let ctl = NetCtl {
            if_addr: Some("fe80::1".to_string()),
            ..Default::default()
        };
        apply_net_ctl("eth0", &ctl).unwrap();
    }
}
