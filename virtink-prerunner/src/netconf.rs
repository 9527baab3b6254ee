//! In-pod network setup for bridge and masquerade bindings.
//!
//! Bridge mode moves the pod link under a per-network bridge, hands its MAC
//! and addressing to the guest over a tap, and serves the original IP back
//! via DHCP. Masquerade mode leaves the pod link alone and NATs between it
//! and a bridged tap subnet.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use futures::TryStreamExt;
use ipnet::{Ipv4Net, Ipv6Net};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use netlink_packet_route::AddressFamily;
use rand::Rng;
use rtnetlink::{Handle, IpVersion};
use tokio::process::Command;
use tracing::{info, warn};

use virtink_api::cloudhypervisor::NetConfig;

const DNSMASQ_DIR: &str = "/var/run/virtink/dnsmasq";
const KEA_DIR: &str = "/var/run/virtink/kea";

pub struct NetSetup {
    handle: Handle,
}

struct LinkInfo {
    index: u32,
    mac: [u8; 6],
}

impl NetSetup {
    pub async fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().context("netlink connection")?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Bridge the pod link into the guest: `br-<link>` owns the wire, a tap
    /// carries the guest, and the guest inherits the link's MAC, address and
    /// gateway (served over DHCP).
    pub async fn setup_bridge(&self, link_name: &str, network_index: usize) -> Result<NetConfig> {
        let link = self.link_by_name(link_name).await?;
        let link_mac = link.mac;
        let link_addr = self.first_ipv4_addr(link.index).await?;
        let link_gateway = self.default_ipv4_gateway(link.index).await?;

        let bridge_name = format!("br-{}", link_name);
        let bridge_net: Ipv4Net = format!("169.254.{}.1/30", 200 + network_index)
            .parse()
            .context("bridge subnet")?;
        let bridge_index = self.add_bridge(&bridge_name, bridge_net).await?;

        self.handle
            .link()
            .set(link.index)
            .down()
            .execute()
            .await
            .context("down link")?;

        // The guest takes over the link's MAC; give the host side a fresh
        // same-vendor address.
        let spoofed = spoof_mac_same_vendor(&link_mac);
        self.handle
            .link()
            .set(link.index)
            .address(spoofed.to_vec())
            .execute()
            .await
            .context("spoof link MAC")?;

        if let Some((addr, prefix, message)) = &link_addr {
            self.handle
                .address()
                .del(message.clone())
                .execute()
                .await
                .context("delete link address")?;

            // Keep the original name resolvable for the kubelet: rename the
            // link and park its address on a dummy.
            let nic_name = format!("{}-nic", link_name);
            self.handle
                .link()
                .set(link.index)
                .name(nic_name)
                .execute()
                .await
                .context("rename link")?;
            self.handle
                .link()
                .add()
                .dummy(link_name.to_owned())
                .execute()
                .await
                .context("add dummy link")?;
            let dummy = self.link_by_name(link_name).await?;
            self.handle
                .address()
                .add(dummy.index, std::net::IpAddr::V4(*addr), *prefix)
                .execute()
                .await
                .context("address dummy link")?;
            self.handle
                .link()
                .set(dummy.index)
                .up()
                .execute()
                .await
                .context("up dummy link")?;
        }

        self.handle
            .link()
            .set(link.index)
            .controller(bridge_index)
            .execute()
            .await
            .context("enslave link to bridge")?;
        self.handle
            .link()
            .set(link.index)
            .up()
            .execute()
            .await
            .context("up link")?;

        let tap_name = format!("tap-{}", link_name);
        create_tap(&tap_name)?;
        let tap = self.link_by_name(&tap_name).await?;
        self.handle
            .link()
            .set(tap.index)
            .controller(bridge_index)
            .execute()
            .await
            .context("enslave tap to bridge")?;
        self.handle
            .link()
            .set(tap.index)
            .up()
            .execute()
            .await
            .context("up tap")?;

        if let Some((addr, prefix, _)) = link_addr {
            let net = Ipv4Net::new(addr, prefix).context("link subnet")?;
            start_dnsmasq(
                &bridge_name,
                &format_mac(&link_mac),
                addr,
                net.netmask(),
                link_gateway,
            )
            .await?;
        }

        info!(link = %link_name, bridge = %bridge_name, tap = %tap_name, "bridge network up");
        Ok(NetConfig {
            tap: Some(tap_name),
            mac: Some(format_mac(&link_mac)),
            id: None,
            vhost_user: false,
            vhost_socket: None,
            num_queues: None,
        })
    }

    /// NAT the pod address onto a private tap subnet: the guest lives at the
    /// third address of the CIDR behind DNAT/MASQUERADE on the pod link.
    pub async fn setup_masquerade(
        &self,
        link_name: &str,
        network_index: usize,
        ipv4_cidr: &str,
        ipv6_cidr: &str,
        guest_mac: &str,
    ) -> Result<NetConfig> {
        let net: Ipv4Net = ipv4_cidr.parse().context("masquerade IPv4 CIDR")?;
        let mut hosts = net.hosts();
        let gateway = hosts.next().context("masquerade subnet too small")?;
        let guest_ip = hosts.next().context("masquerade subnet too small")?;

        let bridge_name = format!("br-{}", link_name);
        let bridge_index = self
            .add_bridge(&bridge_name, Ipv4Net::new(gateway, net.prefix_len())?)
            .await?;

        if !ipv6_cidr.is_empty() {
            let net6: Ipv6Net = ipv6_cidr.parse().context("masquerade IPv6 CIDR")?;
            let gateway6 = nth_ipv6(&net6, 1);
            self.handle
                .address()
                .add(bridge_index, std::net::IpAddr::V6(gateway6), net6.prefix_len())
                .execute()
                .await
                .context("address bridge (IPv6)")?;
        }

        let tap_name = format!("tap-{}", link_name);
        create_tap(&tap_name)?;
        let tap = self.link_by_name(&tap_name).await?;
        self.handle
            .link()
            .set(tap.index)
            .controller(bridge_index)
            .execute()
            .await
            .context("enslave tap to bridge")?;
        self.handle
            .link()
            .set(tap.index)
            .up()
            .execute()
            .await
            .context("up tap")?;

        run_command(
            "iptables",
            &[
                "-t", "nat", "-A", "PREROUTING", "-i", link_name, "-j", "DNAT",
                "--to-destination", &guest_ip.to_string(),
            ],
        )
        .await?;
        run_command(
            "iptables",
            &[
                "-t", "nat", "-A", "POSTROUTING", "-s", &guest_ip.to_string(), "-o", link_name,
                "-j", "MASQUERADE",
            ],
        )
        .await?;
        if !ipv6_cidr.is_empty() {
            let net6: Ipv6Net = ipv6_cidr.parse()?;
            let guest_ip6 = nth_ipv6(&net6, 2);
            run_command(
                "ip6tables",
                &[
                    "-t", "nat", "-A", "PREROUTING", "-i", link_name, "-j", "DNAT",
                    "--to-destination", &guest_ip6.to_string(),
                ],
            )
            .await?;
            run_command(
                "ip6tables",
                &[
                    "-t", "nat", "-A", "POSTROUTING", "-s", &guest_ip6.to_string(), "-o",
                    link_name, "-j", "MASQUERADE",
                ],
            )
            .await?;
            start_kea(&bridge_name, &net6).await?;
        }

        let mac = parse_mac(guest_mac).context("guest MAC")?;
        start_dnsmasq(&bridge_name, guest_mac, guest_ip, net.netmask(), Some(gateway)).await?;

        info!(link = %link_name, bridge = %bridge_name, guest_ip = %guest_ip, index = network_index, "masquerade network up");
        Ok(NetConfig {
            tap: Some(tap_name),
            mac: Some(format_mac(&mac)),
            id: None,
            vhost_user: false,
            vhost_socket: None,
            num_queues: None,
        })
    }

    async fn link_by_name(&self, name: &str) -> Result<LinkInfo> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_owned())
            .execute();
        let link = links
            .try_next()
            .await
            .with_context(|| format!("get link {:?}", name))?
            .with_context(|| format!("link {:?} not found", name))?;
        let mut mac = [0u8; 6];
        for attr in &link.attributes {
            if let LinkAttribute::Address(addr) = attr {
                if addr.len() == 6 {
                    mac.copy_from_slice(addr);
                }
            }
        }
        Ok(LinkInfo {
            index: link.header.index,
            mac,
        })
    }

    async fn add_bridge(&self, name: &str, net: Ipv4Net) -> Result<u32> {
        self.handle
            .link()
            .add()
            .bridge(name.to_owned())
            .execute()
            .await
            .with_context(|| format!("add bridge {:?}", name))?;
        let bridge = self.link_by_name(name).await?;
        self.handle
            .address()
            .add(bridge.index, std::net::IpAddr::V4(net.addr()), net.prefix_len())
            .execute()
            .await
            .context("address bridge")?;
        self.handle
            .link()
            .set(bridge.index)
            .up()
            .execute()
            .await
            .context("up bridge")?;
        Ok(bridge.index)
    }

    async fn first_ipv4_addr(
        &self,
        index: u32,
    ) -> Result<Option<(Ipv4Addr, u8, AddressMessage)>> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(message) = addrs.try_next().await.context("list addresses")? {
            if message.header.family != AddressFamily::Inet {
                continue;
            }
            for attr in &message.attributes {
                if let AddressAttribute::Address(std::net::IpAddr::V4(addr)) = attr {
                    return Ok(Some((*addr, message.header.prefix_len, message.clone())));
                }
            }
        }
        Ok(None)
    }

    async fn default_ipv4_gateway(&self, index: u32) -> Result<Option<Ipv4Addr>> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(route) = routes.try_next().await.context("list routes")? {
            let mut oif = None;
            let mut gateway = None;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Oif(i) => oif = Some(*i),
                    RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
                    _ => {}
                }
            }
            if oif == Some(index) {
                if let Some(gateway) = gateway {
                    return Ok(Some(gateway));
                }
            }
        }
        Ok(None)
    }
}

// TUN device constants from linux/if_tun.h.
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Create a persistent tap device the VMM can open by name.
fn create_tap(name: &str) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if name.len() >= libc::IFNAMSIZ {
        bail!("tap name {:?} too long", name);
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .context("open /dev/net/tun")?;

    let mut ifr = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (i, b) in name.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = *b as libc::c_char;
    }

    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) } < 0 {
        return Err(std::io::Error::last_os_error()).context("TUNSETIFF");
    }
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETPERSIST as _, 1) } < 0 {
        return Err(std::io::Error::last_os_error()).context("TUNSETPERSIST");
    }
    Ok(())
}

/// Keep the vendor OUI, randomize the NIC-specific bytes.
fn spoof_mac_same_vendor(mac: &[u8; 6]) -> [u8; 6] {
    let mut rng = rand::thread_rng();
    let mut spoofed = *mac;
    for byte in spoofed.iter_mut().skip(3) {
        *byte = rng.gen();
    }
    spoofed
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

/// The nth address inside an IPv6 net.
fn nth_ipv6(net: &Ipv6Net, n: u128) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(net.network()) + n)
}

async fn start_dnsmasq(
    iface: &str,
    mac: &str,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
) -> Result<()> {
    let resolv = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
    let (dns_servers, search_domains) = parse_resolv_conf(&resolv);

    let conf = render_dnsmasq_conf(iface, mac, ip, netmask, gateway, &dns_servers, &search_domains);
    tokio::fs::create_dir_all(DNSMASQ_DIR)
        .await
        .context("create dnsmasq dir")?;
    let conf_path = format!("{}/{}.conf", DNSMASQ_DIR, iface);
    tokio::fs::write(&conf_path, conf)
        .await
        .context("write dnsmasq config")?;

    run_command(
        "dnsmasq",
        &[
            &format!("--conf-file={}", conf_path),
            &format!("--pid-file={}/{}.pid", DNSMASQ_DIR, iface),
        ],
    )
    .await
}

pub fn render_dnsmasq_conf(
    iface: &str,
    mac: &str,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    dns_servers: &[Ipv4Addr],
    search_domains: &[String],
) -> String {
    let mut conf = format!(
        "port=0\n\
         interface={iface}\n\
         bind-interfaces\n\
         leasefile-ro\n\
         dhcp-range={ip},static\n\
         dhcp-host={mac},{ip},infinite\n\
         dhcp-option=option:netmask,{netmask}\n"
    );
    if let Some(gateway) = gateway {
        conf.push_str(&format!("dhcp-option=option:router,{}\n", gateway));
    }
    if !dns_servers.is_empty() {
        let servers: Vec<String> = dns_servers.iter().map(|s| s.to_string()).collect();
        conf.push_str(&format!(
            "dhcp-option=option:dns-server,{}\n",
            servers.join(",")
        ));
    }
    if !search_domains.is_empty() {
        conf.push_str(&format!(
            "dhcp-option=option:domain-search,{}\n",
            search_domains.join(",")
        ));
    }
    conf
}

pub fn parse_resolv_conf(content: &str) -> (Vec<Ipv4Addr>, Vec<String>) {
    let mut servers = Vec::new();
    let mut search = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(server) = line.strip_prefix("nameserver ") {
            if let Ok(addr) = server.trim().parse::<Ipv4Addr>() {
                servers.push(addr);
            }
        } else if let Some(domains) = line.strip_prefix("search ") {
            search.extend(domains.split_whitespace().map(str::to_owned));
        }
    }
    (servers, search)
}

async fn start_kea(iface: &str, net: &Ipv6Net) -> Result<()> {
    let conf = render_kea_conf(iface, net);
    tokio::fs::create_dir_all(KEA_DIR).await.context("create kea dir")?;
    let conf_path = format!("{}/{}.json", KEA_DIR, iface);
    tokio::fs::write(&conf_path, conf)
        .await
        .context("write kea config")?;
    run_command("kea-dhcp6", &["-c", &conf_path]).await
}

pub fn render_kea_conf(iface: &str, net: &Ipv6Net) -> String {
    let guest = nth_ipv6(net, 2);
    serde_json::to_string_pretty(&serde_json::json!({
        "Dhcp6": {
            "interfaces-config": { "interfaces": [iface] },
            "lease-database": { "type": "memfile", "persist": false },
            "subnet6": [{
                "subnet": net.to_string(),
                "pools": [{ "pool": format!("{}-{}", guest, guest) }],
            }],
        }
    }))
    .expect("kea config is serializable")
}

async fn run_command(name: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(name)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawn {}", name))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(command = %name, stderr = %stderr, "command failed");
        bail!("{} failed: {}", name, stderr);
    }
    Ok(())
}

/// Spawn one virtiofsd per filesystem share; the VMM connects to its socket.
pub async fn start_virtiofsd(socket: &str, shared_dir: &Path) -> Result<()> {
    tokio::process::Command::new("virtiofsd")
        .arg("--socket-path")
        .arg(socket)
        .arg("--shared-dir")
        .arg(shared_dir)
        .arg("--cache")
        .arg("auto")
        .spawn()
        .context("spawn virtiofsd")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnsmasq_conf_pins_the_guest() {
        let conf = render_dnsmasq_conf(
            "br-eth0",
            "52:54:00:12:34:56",
            "10.244.1.12".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            Some("10.244.1.1".parse().unwrap()),
            &["10.96.0.10".parse().unwrap()],
            &["cluster.local".to_owned(), "svc.cluster.local".to_owned()],
        );
        assert!(conf.contains("interface=br-eth0"));
        assert!(conf.contains("dhcp-host=52:54:00:12:34:56,10.244.1.12,infinite"));
        assert!(conf.contains("dhcp-option=option:router,10.244.1.1"));
        assert!(conf.contains("dhcp-option=option:dns-server,10.96.0.10"));
        assert!(conf.contains("domain-search,cluster.local,svc.cluster.local"));
    }

    #[test]
    fn dnsmasq_conf_omits_empty_options() {
        let conf = render_dnsmasq_conf(
            "br-net1",
            "52:54:00:00:00:01",
            "10.0.2.2".parse().unwrap(),
            "255.255.255.252".parse().unwrap(),
            None,
            &[],
            &[],
        );
        assert!(!conf.contains("option:router"));
        assert!(!conf.contains("option:dns-server"));
    }

    #[test]
    fn resolv_conf_parsing() {
        let (servers, search) = parse_resolv_conf(
            "# comment\nnameserver 10.96.0.10\nnameserver fd00::10\nsearch default.svc.cluster.local svc.cluster.local\n",
        );
        assert_eq!(servers, vec!["10.96.0.10".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(
            search,
            vec!["default.svc.cluster.local".to_owned(), "svc.cluster.local".to_owned()]
        );
    }

    #[test]
    fn mac_round_trip_and_spoof_keeps_vendor() {
        let mac = parse_mac("52:54:00:ab:cd:ef").unwrap();
        assert_eq!(format_mac(&mac), "52:54:00:ab:cd:ef");
        let spoofed = spoof_mac_same_vendor(&mac);
        assert_eq!(&spoofed[..3], &mac[..3]);

        assert!(parse_mac("not-a-mac").is_none());
        assert!(parse_mac("52:54:00:ab:cd").is_none());
    }

    #[test]
    fn ipv6_host_addressing() {
        let net: Ipv6Net = "fd10:0:2::/120".parse().unwrap();
        assert_eq!(nth_ipv6(&net, 1).to_string(), "fd10:0:2::1");
        assert_eq!(nth_ipv6(&net, 2).to_string(), "fd10:0:2::2");
    }

    #[test]
    fn kea_conf_serves_the_guest_address() {
        let net: Ipv6Net = "fd10:0:2::/120".parse().unwrap();
        let conf = render_kea_conf("br-eth0", &net);
        assert!(conf.contains("\"fd10:0:2::2-fd10:0:2::2\""));
        assert!(conf.contains("br-eth0"));
    }
}
