//! Host identity used to stamp every outbound message.
//!
//! Collected once on first use and cached for the process lifetime. Every
//! probe is best effort: a field that cannot be determined is simply omitted
//! from the wire documents.

use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tokio::sync::OnceCell;
use tracing::debug;

const EC2_INSTANCE_ID_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";
const EC2_ZONE_URL: &str = "http://169.254.169.254/latest/meta-data/placement/availability-zone";
const HYPERVISOR_UUID_PATH: &str = "/sys/hypervisor/uuid";
const CGROUP_PATH: &str = "/proc/self/cgroup";
const EC2_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// The cached identity record for this process and host.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub hostname: String,
    pub pid: u32,
    pub distro: String,
    pub uname_sysname: Option<String>,
    pub uname_version: Option<String>,
    pub ip_addresses: Vec<String>,
    pub mac_addresses: Vec<String>,
    pub ec2_instance_id: Option<String>,
    pub ec2_zone: Option<String>,
    pub container_id: Option<String>,
    /// Stable host identifier derived from the strongest available source.
    pub uuid: String,
}

static HOST_IDENTITY: OnceCell<HostIdentity> = OnceCell::const_new();

/// Returns the process-wide identity record, detecting it on first call.
/// `hostname_alias` only takes effect on that first call.
pub async fn host_identity(hostname_alias: Option<&str>) -> &'static HostIdentity {
    HOST_IDENTITY
        .get_or_init(|| HostIdentity::detect(hostname_alias))
        .await
}

impl HostIdentity {
    pub async fn detect(hostname_alias: Option<&str>) -> HostIdentity {
        let hostname = match hostname_alias {
            Some(alias) if !alias.is_empty() => alias.to_string(),
            _ => str_by_keyword(Path::new("/proc/sys/kernel/hostname"), "")
                .unwrap_or_else(|| "unknown".to_string()),
        };

        let (ip_addresses, mac_addresses) = interface_addresses();
        let container_id = container_id_from(Path::new(CGROUP_PATH));
        let (ec2_instance_id, ec2_zone) = ec2_metadata().await;

        let uuid = host_uuid(
            container_id.as_deref(),
            ec2_instance_id.as_deref(),
            &mac_addresses,
        );

        HostIdentity {
            hostname,
            pid: std::process::id(),
            distro: detect_distro_in(Path::new("/etc")),
            uname_sysname: str_by_keyword(Path::new("/proc/sys/kernel/ostype"), ""),
            uname_version: str_by_keyword(Path::new("/proc/sys/kernel/version"), ""),
            ip_addresses,
            mac_addresses,
            ec2_instance_id,
            ec2_zone,
            container_id,
            uuid,
        }
    }
}

/// Reads a file and returns the first line containing `keyword` (the first
/// line overall when the keyword is empty).
fn line_by_keyword(path: &Path, keyword: &str) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);
    reader
        .lines()
        .map_while(Result::ok)
        .find(|line| line.contains(keyword))
}

fn str_by_keyword(path: &Path, keyword: &str) -> Option<String> {
    let line = line_by_keyword(path, keyword)?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Probes the usual /etc release files for a distribution string. Order
/// matters: some distributions ship files that also exist elsewhere with a
/// different meaning.
fn detect_distro_in(etc: &Path) -> String {
    if let Some(redhat) = str_by_keyword(&etc.join("redhat-release"), "") {
        return redhat;
    }

    if let Some(amazon) = str_by_keyword(&etc.join("release-cpe"), "") {
        if let Some(release) = amazon.rsplit(':').next().filter(|s| !s.is_empty()) {
            return format!("Amzn Linux {release}");
        }
    }

    if let Some(ubuntu) = str_by_keyword(&etc.join("lsb-release"), "DISTRIB_DESCRIPTION") {
        let description = ubuntu
            .rsplit('=')
            .next()
            .map(|s| s.trim_matches('"'))
            .filter(|s| !s.is_empty());
        return match description {
            Some(description) => description.to_string(),
            None => "Ubuntu unknown".to_string(),
        };
    }

    let fallbacks: [(&str, bool); 5] = [
        ("debian_version", true),
        ("SuSE-release", false),
        ("slackware-version", false),
        ("gentoo-release", false),
        ("issue", false),
    ];
    for (file, is_debian) in fallbacks {
        if let Some(line) = str_by_keyword(&etc.join(file), "") {
            return if is_debian {
                format!("Debian {line}")
            } else {
                line
            };
        }
    }

    "Unknown".to_string()
}

/// Collects non-loopback IP and MAC addresses from the host interfaces.
fn interface_addresses() -> (Vec<String>, Vec<String>) {
    let mut ips = Vec::new();
    let mut macs = Vec::new();

    let Ok(addrs) = getifaddrs() else {
        return (ips, macs);
    };
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            ips.push(sin.ip().to_string());
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            ips.push(sin6.ip().to_string());
        } else if let Some(link) = address.as_link_addr() {
            if let Some(mac) = link.addr() {
                if mac.iter().any(|b| *b != 0) {
                    macs.push(format_mac(&mac));
                }
            }
        }
    }

    (ips, macs)
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Extracts the container id from a cgroup line such as
/// `9:devices:/docker/40188af1...`.
fn container_id_from(path: &Path) -> Option<String> {
    let line = line_by_keyword(path, "docker")?;
    let tokens: Vec<&str> = line.split('/').collect();
    if tokens.len() != 3 || tokens[2].is_empty() {
        return None;
    }
    Some(tokens[2].to_string())
}

fn is_ec2_instance() -> bool {
    line_by_keyword(Path::new(HYPERVISOR_UUID_PATH), "ec2")
        .map(|line| line.starts_with("ec2"))
        .unwrap_or(false)
}

/// Fetches the EC2 instance id and availability zone from the instance
/// metadata endpoint. Skipped entirely off EC2; a short timeout keeps a
/// wedged endpoint from stalling the first flush.
async fn ec2_metadata() -> (Option<String>, Option<String>) {
    if !is_ec2_instance() {
        return (None, None);
    }
    let client = match reqwest::Client::builder().timeout(EC2_FETCH_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            debug!(%err, "cannot build EC2 metadata client");
            return (None, None);
        }
    };
    (
        fetch_metadata(&client, EC2_INSTANCE_ID_URL).await,
        fetch_metadata(&client, EC2_ZONE_URL).await,
    )
}

async fn fetch_metadata(client: &reqwest::Client, url: &str) -> Option<String> {
    match client.get(url).send().await {
        Ok(response) => response.text().await.ok().filter(|body| !body.is_empty()),
        Err(err) => {
            debug!(url, %err, "EC2 metadata fetch failed");
            None
        }
    }
}

/// Derives the stable host UUID: container id, then EC2 instance id, then
/// the MAC list, else `undefined`.
fn host_uuid(container_id: Option<&str>, ec2_id: Option<&str>, macs: &[String]) -> String {
    if let Some(id) = container_id {
        return format!("container:{id}");
    }
    if let Some(id) = ec2_id {
        return format!("aws:{id}");
    }
    if !macs.is_empty() {
        return format!("mac:{}", macs.join(","));
    }
    "undefined".to_string()
}
