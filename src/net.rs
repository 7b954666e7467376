use std::borrow::Cow;

/// Normalizes a bind/listen address.
///
/// Config shorthand `":PORT"` means "all interfaces"; `SocketAddr` parsing
/// and the Tokio bind APIs want an explicit host, so expand it.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Appends `default_port` when `authority` carries none. Bracketed IPv6
/// literals are respected.
pub fn ensure_port(authority: &str, default_port: u16) -> String {
    let s = authority.trim();
    let tail = match s.rfind(']') {
        Some(pos) => &s[pos + 1..],
        None => s,
    };
    if tail.contains(':') {
        s.to_string()
    } else {
        format!("{s}:{default_port}")
    }
}
