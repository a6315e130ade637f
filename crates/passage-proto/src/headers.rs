//! Header list handling
//!
//! HTTP/1 and HTTP/2 header sets are two canonical forms of the same
//! logical multimap; the conversions here are total functions of the
//! input (a missing `:status` converts to 200, a missing `Host` simply
//! yields no authority).

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::event::HeaderList;
use crate::ProtoError;

/// Validate one header entry: ASCII name, value free of NUL/CR/LF.
pub fn validate(name: &str, value: &str) -> Result<(), ProtoError> {
    if name.is_empty() || !name.is_ascii() {
        return Err(ProtoError::InvalidHeader(name.to_string()));
    }
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(ProtoError::InvalidHeader(name.to_string()));
    }
    Ok(())
}

/// Extract the status code from an HTTP/2-shaped header list and drop all
/// pseudo-headers. A list with no `:status` maps to 200.
pub fn split_status(headers: HeaderList) -> (u16, HeaderList) {
    let mut status = 200u16;
    let mut rest = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        if let Some(pseudo) = name.strip_prefix(':') {
            if pseudo == "status" {
                if let Ok(code) = value.trim().parse::<u16>() {
                    status = code;
                }
            }
            continue;
        }
        rest.push((name, value));
    }
    (status, rest)
}

/// First `Host` value in the list, case-insensitive.
pub fn host(headers: &HeaderList) -> Option<&str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.as_str())
}

/// First value of the named header, case-insensitive.
pub fn get<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Whether the request is gRPC, judged by its content type.
pub fn is_grpc(headers: &HeaderList) -> bool {
    get(headers, "content-type")
        .map(|ct| ct.starts_with("application/grpc"))
        .unwrap_or(false)
}

/// Connection-scoped HTTP/1 headers that must not be forwarded onto an
/// HTTP/2 stream.
pub fn is_connection_scoped(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Convert a header list into an `http::HeaderMap`, preserving order and
/// duplicates. Pseudo-headers and entries that fail parsing are skipped.
pub fn to_header_map(headers: &HeaderList) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name.starts_with(':') {
            continue;
        }
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_bytes(value.as_bytes()).ok());
        match parsed {
            Some((name, value)) => {
                map.append(name, value);
            }
            None => warn!(header = %name, "Dropping unparseable header"),
        }
    }
    map
}

/// Convert an `http::HeaderMap` back into an ordered header list.
pub fn from_header_map(map: &HeaderMap) -> HeaderList {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_control_bytes() {
        assert!(validate("x-ok", "value").is_ok());
        assert!(validate("x-bad", "a\r\nb").is_err());
        assert!(validate("x-bad", "a\0b").is_err());
        assert!(validate("", "v").is_err());
    }

    #[test]
    fn test_split_status_extracts_and_strips_pseudo() {
        let headers = vec![
            (":status".to_string(), "204".to_string()),
            (":custom".to_string(), "x".to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
        ];
        let (status, rest) = split_status(headers);
        assert_eq!(status, 204);
        assert_eq!(
            rest,
            vec![("content-type".to_string(), "application/grpc".to_string())]
        );
    }

    #[test]
    fn test_split_status_defaults_to_200() {
        let (status, rest) = split_status(vec![("x".to_string(), "y".to_string())]);
        assert_eq!(status, 200);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_host_case_insensitive() {
        let headers = vec![("HOST".to_string(), "example.test".to_string())];
        assert_eq!(host(&headers), Some("example.test"));
        assert_eq!(host(&Vec::new()), None);
    }

    #[test]
    fn test_is_grpc() {
        let grpc = vec![(
            "content-type".to_string(),
            "application/grpc+proto".to_string(),
        )];
        let plain = vec![("content-type".to_string(), "application/json".to_string())];
        assert!(is_grpc(&grpc));
        assert!(!is_grpc(&plain));
    }

    #[test]
    fn test_header_map_roundtrip_preserves_duplicates() {
        let headers = vec![
            ("set-cookie".to_string(), "a=1".to_string()),
            ("set-cookie".to_string(), "b=2".to_string()),
            (":status".to_string(), "200".to_string()),
        ];
        let map = to_header_map(&headers);
        assert_eq!(map.get_all("set-cookie").iter().count(), 2);

        let back = from_header_map(&map);
        assert_eq!(
            back,
            vec![
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ]
        );
    }

    #[test]
    fn test_connection_scoped() {
        assert!(is_connection_scoped("Connection"));
        assert!(is_connection_scoped("transfer-encoding"));
        assert!(!is_connection_scoped("te"));
        assert!(!is_connection_scoped("grpc-timeout"));
    }
}
