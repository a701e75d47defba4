use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::DiscoveryUuid;

/// The three namespace families. They differ only in how the slug is built;
/// everything downstream is the same machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceKind {
    /// Shared-IP namespace: the slug is the hyphen-escaped public IP.
    Public { ip: IpAddr },
    /// User-named namespace. `advanced` skips the prefix and sanitizer and
    /// uses the name verbatim.
    Custom { name: String, advanced: bool },
    /// Time-rotating rendezvous namespace keyed by an HMAC slug.
    Rendezvous { slug: String },
}

/// Pure endpoint-string builders for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    prefix: String,
    kind: NamespaceKind,
}

impl NamespaceConfig {
    pub fn new(prefix: impl Into<String>, kind: NamespaceKind) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
        }
    }

    pub fn kind(&self) -> &NamespaceKind {
        &self.kind
    }

    pub fn is_rendezvous(&self) -> bool {
        matches!(self.kind, NamespaceKind::Rendezvous { .. })
    }

    /// Stable identifier for this namespace — also the shared stem of every
    /// endpoint string it produces.
    pub fn base(&self) -> String {
        match &self.kind {
            NamespaceKind::Public { ip } => {
                format!("{}-{}", self.prefix, ip.to_string().replace(['.', ':'], "-"))
            }
            NamespaceKind::Custom { name, advanced } => {
                if *advanced {
                    name.clone()
                } else {
                    format!("{}-ns-{}", self.prefix, sanitize_slug(name))
                }
            }
            NamespaceKind::Rendezvous { slug } => format!("{}-rvz-{}", self.prefix, slug),
        }
    }

    pub fn router_id(&self, level: u8) -> String {
        format!("{}-{}", self.base(), level)
    }

    pub fn discovery_id(&self, uuid: &DiscoveryUuid) -> String {
        format!("{}-{}", self.base(), uuid)
    }

    pub fn peer_slot_id(&self) -> String {
        format!("{}-p1", self.base())
    }

    /// Recover the discovery uuid from a discovery id of this namespace.
    pub fn uuid_of(&self, discovery_id: &str) -> Option<String> {
        let stem = format!("{}-", self.base());
        let rest = discovery_id.strip_prefix(&stem)?;
        (rest.len() == 32 && rest.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| rest.to_string())
    }
}

/// Lowercase, alphanumeric, single hyphens. Everything else collapses.
fn sanitize_slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid() -> DiscoveryUuid {
        DiscoveryUuid::parse("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn public_endpoints() {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Public {
                ip: "203.0.113.7".parse().unwrap(),
            },
        );
        assert_eq!(cfg.router_id(1), "pfx-203-0-113-7-1");
        assert_eq!(cfg.peer_slot_id(), "pfx-203-0-113-7-p1");
        assert_eq!(
            cfg.discovery_id(&uuid()),
            "pfx-203-0-113-7-0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn custom_endpoints_sanitized() {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Custom {
                name: "My Cool  Namespace!".into(),
                advanced: false,
            },
        );
        assert_eq!(cfg.router_id(2), "pfx-ns-my-cool-namespace-2");
    }

    #[test]
    fn custom_advanced_uses_verbatim_name() {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Custom {
                name: "raw.Name".into(),
                advanced: true,
            },
        );
        assert_eq!(cfg.router_id(1), "raw.Name-1");
        assert_eq!(cfg.peer_slot_id(), "raw.Name-p1");
    }

    #[test]
    fn rendezvous_endpoints() {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Rendezvous {
                slug: "00aabbccddeeff11".into(),
            },
        );
        assert_eq!(cfg.router_id(1), "pfx-rvz-00aabbccddeeff11-1");
        assert!(cfg.is_rendezvous());
    }

    #[test]
    fn uuid_recovery() {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Public {
                ip: "10.0.0.1".parse().unwrap(),
            },
        );
        let disc = cfg.discovery_id(&uuid());
        assert_eq!(cfg.uuid_of(&disc).as_deref(), Some(uuid().as_str()));
        assert!(cfg.uuid_of("pfx-10-0-0-1-p1").is_none());
        assert!(cfg.uuid_of("other-10-0-0-1-abc").is_none());
    }

    #[test]
    fn ipv6_slug_has_no_colons() {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Public {
                ip: "2001:db8::7".parse().unwrap(),
            },
        );
        assert!(!cfg.base().contains(':'));
    }

    #[test]
    fn sanitize_edge_cases() {
        assert_eq!(sanitize_slug("Hello World"), "hello-world");
        assert_eq!(sanitize_slug("--a--b--"), "a-b");
        assert_eq!(sanitize_slug("ÜBER"), "ber");
    }
}
