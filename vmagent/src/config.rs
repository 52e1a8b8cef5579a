//! Fixed defaults, overridable by environment variable. No config
//! file and no CLI parsing: PID 1 has no argv worth parsing, so this
//! follows the same plain-env-var lookup peimage-service uses.

use std::path::PathBuf;

fn env_or<'a>(key: &str, default: &'a str) -> String {
    std::env::vars()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
        .unwrap_or_else(|| default.to_string())
}

pub struct Config {
    pub cmd_device: String,
    pub vpn_device: String,
    pub inet_device: String,
    pub output_prefix: PathBuf,
    pub vpn_if_name: String,
    pub inet_if_name: String,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            cmd_device: env_or("VMAGENT_CMD_DEVICE", "/dev/vport0p1"),
            vpn_device: env_or("VMAGENT_VPN_DEVICE", "/dev/vport0p2"),
            inet_device: env_or("VMAGENT_INET_DEVICE", "/dev/vport0p3"),
            output_prefix: PathBuf::from(env_or(
                "VMAGENT_OUTPUT_PREFIX",
                "/var/tmp/guest_agent_private/fds",
            )),
            vpn_if_name: env_or("VMAGENT_VPN_IF", "eth0"),
            inet_if_name: env_or("VMAGENT_INET_IF", "eth1"),
        }
    }
}
