use ipnet::IpNet;
use std::sync::LazyLock;

/// Loopback, private, link-local, shared (CGNAT), multicast and unspecified
/// ranges for both address families.
const PRIVATE_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

static PRIVATE_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    PRIVATE_CIDRS
        .iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect()
});

pub fn private_networks() -> &'static [IpNet] {
    &PRIVATE_NETS
}
