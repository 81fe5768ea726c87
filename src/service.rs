//! Service definitions and per-protocol routing.
//!
//! A service definition describes one servable unit: the route key it is
//! reachable under, the command to spawn for each client, and the transport
//! protocol. Definitions are parsed once from CLI arguments at startup,
//! validated (the executable must resolve on PATH), and frozen in a
//! `RoutingTable`. Every inbound connection or request does an exact-key
//! lookup against that table.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

/// First port tried when a TCP service does not name one itself.
pub const AUTO_TCP_PORT: u16 = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ws,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Ws => write!(f, "ws"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// Immutable description of one servable unit.
///
/// `route` is the lookup key: a port number for TCP, a path segment for
/// WS/HTTP. `port` is the TCP listener port for TCP services and the shared
/// server port otherwise.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub route: String,
    pub command: String,
    pub args: Vec<String>,
    pub protocol: Protocol,
    pub port: u16,
}

/// Parse a `"Route:Exe args"` or bare `"path/to/exe"` service spec.
///
/// Without an explicit route the executable's basename becomes the route,
/// matching how whole folders of executables are served.
pub fn parse_service(spec: &str, protocol: Protocol, port: u16) -> Result<ServiceDefinition, String> {
    let (route, command) = match spec.find(':') {
        Some(i) => (spec[..i].to_string(), spec[i + 1..].to_string()),
        None => {
            let base = Path::new(spec)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(spec)
                .to_string();
            (base, spec.to_string())
        }
    };

    let args: Vec<String> = command.split_whitespace().map(|s| s.to_string()).collect();
    if args.is_empty() {
        return Err(format!("empty command in service spec: {:?}", spec));
    }
    if !exe_exists(&args[0]) {
        return Err(format!("{} is not a recognized command", args[0]));
    }

    Ok(ServiceDefinition {
        route,
        command,
        args,
        protocol,
        port,
    })
}

/// Check whether an executable resolves on PATH (or is a direct path).
pub fn exe_exists(exe: &str) -> bool {
    Command::new("which")
        .arg(exe)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Replace folder entries in a service spec list with one entry per
/// contained file, so a whole directory of executables can be served.
pub fn expand_folders(specs: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for spec in specs {
        let path = Path::new(&spec);
        if path.is_dir() {
            if let Ok(entries) = fs::read_dir(path) {
                for entry in entries.flatten() {
                    if entry.path().is_file() {
                        if let Some(p) = entry.path().to_str() {
                            out.push(p.to_string());
                        }
                    }
                }
            }
        } else {
            out.push(spec);
        }
    }
    out
}

/// Per-protocol route-key → service mapping, built once at startup.
#[derive(Default)]
pub struct RoutingTable {
    http: HashMap<String, Arc<ServiceDefinition>>,
    ws: HashMap<String, Arc<ServiceDefinition>>,
    tcp: Vec<Arc<ServiceDefinition>>,
    next_auto_port: u16,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            http: HashMap::new(),
            ws: HashMap::new(),
            tcp: Vec::new(),
            next_auto_port: AUTO_TCP_PORT,
        }
    }

    /// Register a WS or HTTP service under its route key.
    /// Duplicate keys within a protocol are a startup error.
    pub fn register(&mut self, def: ServiceDefinition) -> Result<(), String> {
        let map = match def.protocol {
            Protocol::Http => &mut self.http,
            Protocol::Ws => &mut self.ws,
            Protocol::Tcp => return self.register_tcp(def, None),
        };
        if map.contains_key(&def.route) {
            return Err(format!(
                "duplicate {} service name: {}",
                def.protocol, def.route
            ));
        }
        map.insert(def.route.clone(), Arc::new(def));
        Ok(())
    }

    /// Register a TCP service. A numeric route is used as the fixed port;
    /// otherwise a port is auto-assigned from the 9000 range, skipping
    /// `shared_port` (the HTTP/WS server port) and ports already taken.
    pub fn register_tcp(
        &mut self,
        mut def: ServiceDefinition,
        shared_port: Option<u16>,
    ) -> Result<(), String> {
        let port = match def.route.parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => {
                while Some(self.next_auto_port) == shared_port
                    || self.tcp.iter().any(|d| d.port == self.next_auto_port)
                {
                    self.next_auto_port += 1;
                }
                let p = self.next_auto_port;
                self.next_auto_port += 1;
                p
            }
        };
        if self.tcp.iter().any(|d| d.port == port) {
            return Err(format!("duplicate tcp service port: {}", port));
        }
        def.port = port;
        self.tcp.push(Arc::new(def));
        Ok(())
    }

    pub fn lookup_http(&self, route: &str) -> Option<Arc<ServiceDefinition>> {
        self.http.get(route).cloned()
    }

    pub fn lookup_ws(&self, route: &str) -> Option<Arc<ServiceDefinition>> {
        self.ws.get(route).cloned()
    }

    pub fn tcp_services(&self) -> &[Arc<ServiceDefinition>] {
        &self.tcp
    }

    pub fn has_http_services(&self) -> bool {
        !self.http.is_empty()
    }

    pub fn has_ws_services(&self) -> bool {
        !self.ws.is_empty()
    }

    pub fn http_services(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.http.values()
    }

    pub fn ws_services(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.ws.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_service() {
        let def = parse_service("greet:cat -u", Protocol::Http, 80).unwrap();
        assert_eq!(def.route, "greet");
        assert_eq!(def.command, "cat -u");
        assert_eq!(def.args, vec!["cat", "-u"]);
    }

    #[test]
    fn test_parse_bare_path_uses_basename() {
        let def = parse_service("/bin/cat", Protocol::Ws, 80).unwrap();
        assert_eq!(def.route, "cat");
        assert_eq!(def.args, vec!["/bin/cat"]);
    }

    #[test]
    fn test_parse_unknown_executable() {
        let err = parse_service("x:definitely-not-a-command-xyz", Protocol::Http, 80).unwrap_err();
        assert!(err.contains("not a recognized command"));
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut table = RoutingTable::new();
        table
            .register(parse_service("hi:cat", Protocol::Http, 80).unwrap())
            .unwrap();
        let err = table
            .register(parse_service("hi:sh", Protocol::Http, 80).unwrap())
            .unwrap_err();
        assert!(err.contains("duplicate http service name: hi"));
    }

    #[test]
    fn test_same_route_allowed_across_protocols() {
        let mut table = RoutingTable::new();
        table
            .register(parse_service("hi:cat", Protocol::Http, 80).unwrap())
            .unwrap();
        table
            .register(parse_service("hi:cat", Protocol::Ws, 80).unwrap())
            .unwrap();
        assert!(table.lookup_http("hi").is_some());
        assert!(table.lookup_ws("hi").is_some());
    }

    #[test]
    fn test_tcp_fixed_and_auto_ports() {
        let mut table = RoutingTable::new();
        table
            .register_tcp(
                parse_service("8011:cat", Protocol::Tcp, 0).unwrap(),
                Some(9000),
            )
            .unwrap();
        table
            .register_tcp(parse_service("cat", Protocol::Tcp, 0).unwrap(), Some(9000))
            .unwrap();
        table
            .register_tcp(
                parse_service("echo:sh", Protocol::Tcp, 0).unwrap(),
                Some(9000),
            )
            .unwrap();
        let ports: Vec<u16> = table.tcp_services().iter().map(|d| d.port).collect();
        // 9000 is the shared server port, so auto assignment starts at 9001.
        assert_eq!(ports, vec![8011, 9001, 9002]);
    }

    #[test]
    fn test_tcp_duplicate_port_rejected() {
        let mut table = RoutingTable::new();
        table
            .register_tcp(parse_service("9100:cat", Protocol::Tcp, 0).unwrap(), None)
            .unwrap();
        let err = table
            .register_tcp(parse_service("9100:sh", Protocol::Tcp, 0).unwrap(), None)
            .unwrap_err();
        assert!(err.contains("duplicate tcp service port"));
    }
}
