//! Host recovery from a plaintext HTTP request prefix.

const METHODS: &[&str] = &[
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "CONNECT ",
];

/// Returns the value of the first `Host:` header of an HTTP request,
/// lower-cased, with a trailing numeric port stripped.
pub fn host(buf: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(buf).ok()?;

    if !METHODS.iter().any(|m| text.starts_with(m)) {
        return None;
    }

    let mut lines = text.split("\r\n");
    lines.next()?; // request line

    let value = lines.take_while(|line| !line.is_empty()).find_map(|line| {
        let (name, value) = line.split_once(':')?;

        name.eq_ignore_ascii_case("host").then(|| value.trim())
    })?;

    if value.is_empty() {
        return None;
    }

    Some(strip_port(value).to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
