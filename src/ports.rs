//! Local TCP port allocation.
//!
//! A port is considered free when a listening socket can be bound to it on
//! 127.0.0.1; the socket is dropped immediately after the check. Supervised
//! services always re-verify health after start, so the allocator trades
//! strict correctness for robustness: an exhausted range falls back to the
//! range start instead of failing.

use std::net::TcpListener;

/// Probe whether `port` can currently be bound on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Find the first free port in `[start, end]`, scanning sequentially.
///
/// Returns `start` when the whole range is taken. Callers must treat the
/// result as a candidate, not a guarantee — the health probe after process
/// start is the actual verification.
pub fn find_free_port(start: u16, end: u16) -> u16 {
    for port in start..=end {
        if is_port_free(port) {
            return port;
        }
    }
    tracing::warn!(
        "No free port in {}-{}, falling back to range start",
        start,
        end
    );
    start
}

/// Ask the OS for an ephemeral port by binding port 0.
pub fn ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port_is_bindable() {
        let port = find_free_port(42000, 42100);
        // The single-caller guarantee: the returned port can be bound
        // immediately afterward.
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok(), "port {} should be bindable", port);
    }

    #[test]
    fn test_find_free_port_skips_taken() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        if taken < u16::MAX - 1 {
            let port = find_free_port(taken, taken + 1);
            assert_ne!(port, taken);
        }
    }

    #[test]
    fn test_exhausted_range_falls_back_to_start() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        // Single-port range that is occupied → documented fallback.
        let port = find_free_port(taken, taken);
        assert_eq!(port, taken);
    }

    #[test]
    fn test_ephemeral_port() {
        let port = ephemeral_port().unwrap();
        assert!(port > 0);
    }
}
