//! Outbound request reconstruction
//!
//! Serializes the client's request for the upstream HTTP proxy: request line,
//! headers in their received order with `Connection: close` forced, optional
//! `Proxy-Authorization`, then whatever payload bytes have arrived so far.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Ordered header list with case-insensitive lookup
///
/// Keeps the order headers arrived in because the relay re-serializes them
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a header without touching existing entries
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace the first header matching `name` in place, dropping any later
    /// duplicates, or append it when absent
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                self.entries[idx] = (name.to_string(), value);
                let mut seen = 0usize;
                self.entries.retain(|(key, _)| {
                    if key.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Builds the bytes sent to the upstream proxy
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    proxy_authorization: Option<String>,
}

impl RequestBuilder {
    /// Credentials are only used when both username and password are non-empty
    pub fn new(username: Option<&str>, password: Option<&str>) -> Self {
        let proxy_authorization = match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                let credentials = format!("{}:{}", username, password);
                Some(format!("Basic {}", BASE64.encode(credentials.as_bytes())))
            }
            _ => None,
        };

        Self {
            proxy_authorization,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.proxy_authorization.is_some()
    }

    /// Serialize the request
    ///
    /// `headers` is updated in place with `Connection: close` so the client's
    /// context reflects what was actually sent.
    pub fn build(&self, method: &str, url: &str, headers: &mut HeaderList, payload: &[u8]) -> Vec<u8> {
        headers.set("Connection", "close");

        let mut head = format!("{} {} HTTP/1.1\r\n", method, url);
        for (key, value) in headers.iter() {
            head.push_str(&format!("{}: {}\r\n", key, value));
        }

        if let Some(auth) = &self.proxy_authorization {
            head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }

        head.push_str("\r\n");

        let mut request = Vec::with_capacity(head.len() + payload.len());
        request.extend_from_slice(head.as_bytes());
        request.extend_from_slice(payload);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> HeaderList {
        [
            ("Host", "example.com"),
            ("User-Agent", "curl/8.0"),
            ("Connection", "keep-alive"),
            ("Accept", "*/*"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_header_set_replaces_in_place() {
        let mut headers = sample_headers();
        headers.set("connection", "close");

        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Host", "User-Agent", "connection", "Accept"]);
        assert_eq!(headers.get("Connection"), Some("close"));
    }

    #[test]
    fn test_header_set_drops_duplicates() {
        let mut headers = HeaderList::new();
        headers.append("connection", "keep-alive");
        headers.append("Host", "a.example");
        headers.append("Connection", "upgrade");

        headers.set("Connection", "close");

        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![("Connection", "close"), ("Host", "a.example")]
        );
    }

    #[test]
    fn test_header_set_appends_when_missing() {
        let mut headers = HeaderList::new();
        headers.append("Host", "a.example");
        headers.set("Connection", "close");
        assert_eq!(
            headers.iter().last(),
            Some(("Connection", "close"))
        );
    }

    #[test]
    fn test_build_request_without_credentials() {
        let builder = RequestBuilder::new(None, None);
        let mut headers = sample_headers();

        let request = builder.build("GET", "http://example.com/", &mut headers, b"");

        assert_eq!(
            String::from_utf8(request).unwrap(),
            "GET http://example.com/ HTTP/1.1\r\n\
             Host: example.com\r\n\
             User-Agent: curl/8.0\r\n\
             Connection: close\r\n\
             Accept: */*\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_build_request_with_credentials() {
        let builder = RequestBuilder::new(Some("u"), Some("p"));
        assert!(builder.has_credentials());

        let mut headers = HeaderList::new();
        headers.append("Host", "example.com");
        let request = builder.build("GET", "http://example.com/", &mut headers, b"");
        let request = String::from_utf8(request).unwrap();

        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(request.ends_with("Proxy-Authorization: Basic dTpw\r\n\r\n"));

        let value = request
            .lines()
            .find_map(|line| line.strip_prefix("Proxy-Authorization: Basic "))
            .unwrap();
        assert_eq!(BASE64.decode(value).unwrap(), b"u:p");
    }

    #[test]
    fn test_credentials_require_both_parts() {
        assert!(!RequestBuilder::new(Some("u"), None).has_credentials());
        assert!(!RequestBuilder::new(None, Some("p")).has_credentials());
        assert!(!RequestBuilder::new(Some("u"), Some("")).has_credentials());
    }

    #[test]
    fn test_build_request_appends_partial_payload_verbatim() {
        let builder = RequestBuilder::new(None, None);
        let mut headers = HeaderList::new();
        headers.append("Content-Length", "10");

        let request = builder.build("POST", "http://example.com/upload", &mut headers, b"abc\x00\xff");

        let expected_head = b"POST http://example.com/upload HTTP/1.1\r\n\
            Content-Length: 10\r\n\
            Connection: close\r\n\
            \r\n";
        assert_eq!(&request[..expected_head.len()], expected_head);
        assert_eq!(&request[expected_head.len()..], b"abc\x00\xff");
    }

    #[test]
    fn test_malformed_header_values_pass_through() {
        let builder = RequestBuilder::new(None, None);
        let mut headers = HeaderList::new();
        headers.append("X-Odd", "  spaced\tvalue ");

        let request = builder.build("GET", "/", &mut headers, b"");
        assert!(String::from_utf8(request)
            .unwrap()
            .contains("X-Odd:   spaced\tvalue \r\n"));
    }
}
