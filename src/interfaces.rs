//! Interface detection for attaching the XDP filter.

use std::fs;
use std::process::Command;
use tracing::debug;

/// Interface to attach to when none is configured: the one carrying the
/// default route, else the first non-loopback interface that is up and has an
/// IPv4 address.
pub fn default_interface() -> Option<String> {
    if let Ok(content) = fs::read_to_string("/proc/net/route") {
        if let Some(iface) = parse_default_route(&content) {
            debug!("Default route interface: {}", iface);
            return Some(iface);
        }
    }

    let output = Command::new("ip")
        .args(["-4", "-o", "addr", "show", "up"])
        .output()
        .ok()?;
    let iface = first_ipv4_interface(&String::from_utf8_lossy(&output.stdout));
    if let Some(ref name) = iface {
        debug!("No default route, using first IPv4 interface: {}", name);
    }
    iface
}

/// Interface of the `00000000` destination in `/proc/net/route` content
fn parse_default_route(content: &str) -> Option<String> {
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "00000000" {
            Some(fields[0].to_string())
        } else {
            None
        }
    })
}

/// First non-loopback interface in `ip -4 -o addr show` output, e.g.
/// `2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0`
fn first_ipv4_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.next()?;
        let name = words.next()?.trim_end_matches(':');
        let name = name.split('@').next().unwrap_or(name);
        if name == "lo" || words.next()? != "inet" {
            return None;
        }
        Some(name.to_string())
    })
}
