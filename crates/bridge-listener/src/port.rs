use std::collections::BTreeSet;
use std::io;
use std::net::TcpListener as StdTcpListener;

const MAX_SCAN_ATTEMPTS: u16 = 100;

/// Finds a free TCP port starting at `preferred`, skipping anything in
/// `claimed`. Probes by binding and immediately dropping a standard-library
/// listener; the real [`tokio::net::TcpListener`] is bound fresh afterward,
/// so this only narrows the search, it does not reserve the port.
pub fn find_available_port(
    host: &str,
    preferred: u16,
    claimed: &BTreeSet<u16>,
) -> Result<u16, io::Error> {
    for offset in 0..MAX_SCAN_ATTEMPTS {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        if claimed.contains(&port) {
            continue;
        }
        if StdTcpListener::bind((host, port)).is_ok() {
            return Ok(port);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!(
            "no available port found in range {preferred}-{}",
            preferred.saturating_add(MAX_SCAN_ATTEMPTS - 1)
        ),
    ))
}

/// One engine's preferred and resolved port.
#[derive(Clone, Debug)]
pub struct ResolvedPort {
    pub name: String,
    pub preferred: u16,
    pub actual: u16,
}

/// Resolves a preferred port per engine (sorted by name, matching the order
/// engines are scanned in elsewhere) to an actually-available one, tracking
/// claimed ports across the whole batch so two engines never collide.
pub fn resolve_engine_ports(
    host: &str,
    engines: &[(String, u16)],
) -> Result<Vec<ResolvedPort>, io::Error> {
    let mut claimed = BTreeSet::new();
    let mut sorted: Vec<&(String, u16)> = engines.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut resolved = Vec::with_capacity(sorted.len());
    for (name, preferred) in sorted {
        let actual = find_available_port(host, *preferred, &claimed)?;
        if actual != *preferred {
            tracing::info!(engine = %name, preferred, actual, "preferred port in use, reassigned");
        }
        claimed.insert(actual);
        resolved.push(ResolvedPort {
            name: name.clone(),
            preferred: *preferred,
            actual,
        });
    }
    Ok(resolved)
}

/// Resolves the single shared port used in multiplex mode.
pub fn resolve_single_port(host: &str, preferred: u16) -> Result<u16, io::Error> {
    let actual = find_available_port(host, preferred, &BTreeSet::new())?;
    if actual != preferred {
        tracing::info!(preferred, actual, "single port in use, reassigned");
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_preferred_port_when_free() {
        let port = find_available_port("127.0.0.1", 19870, &BTreeSet::new()).unwrap();
        assert_eq!(port, 19870);
    }

    #[test]
    fn skips_already_bound_port() {
        let listener = StdTcpListener::bind(("127.0.0.1", 0)).unwrap();
        let occupied_port = listener.local_addr().unwrap().port();
        let found = find_available_port("127.0.0.1", occupied_port, &BTreeSet::new()).unwrap();
        assert_ne!(found, occupied_port);
        drop(listener);
    }

    #[test]
    fn resolve_engine_ports_avoids_collisions_within_batch() {
        let engines = vec![("a".to_string(), 19880u16), ("b".to_string(), 19880u16)];
        let resolved = resolve_engine_ports("127.0.0.1", &engines).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_ne!(resolved[0].actual, resolved[1].actual);
    }
}
