use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde_json::Value;

use super::{CollectionService, ServiceError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking JSON/HTTP transport for the collection service.
///
/// `GET {base}/collections/{name}` returns the whole collection and
/// `PUT {base}/collections/{name}?ifindex=N` replaces the elements of one interface.
pub struct HttpCollectionService {
    client: Client,
    base_url: String,
}

impl HttpCollectionService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sysconf-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ServiceError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/collections/{collection}", self.base_url)
    }
}

fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ServiceError::Rejected(format!("{status}: {body}")))
}

impl CollectionService for HttpCollectionService {
    fn get_collection(&self, collection: &str) -> Result<Vec<Value>, ServiceError> {
        let response = self
            .client
            .get(self.url(collection))
            .send()
            .map_err(|err| ServiceError::Unreachable(err.to_string()))?;
        check_status(response)?
            .json::<Vec<Value>>()
            .map_err(|err| ServiceError::Rejected(format!("unexpected response body: {err}")))
    }

    fn set_collection(
        &self,
        collection: &str,
        ifindex: i32,
        items: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let response = self
            .client
            .put(self.url(collection))
            .query(&[("ifindex", ifindex)])
            .json(&items)
            .send()
            .map_err(|err| ServiceError::Unreachable(err.to_string()))?;
        check_status(response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    struct Captured {
        request_line: String,
        body: String,
    }

    /// Answer exactly one request with `status` and `body`, handing back what was received.
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "connection closed before the request head");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            while buf.len() < header_end + length {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            Captured {
                request_line: head.lines().next().unwrap_or_default().to_string(),
                body: String::from_utf8_lossy(&buf[header_end..]).into_owned(),
            }
        });
        (base, handle)
    }

    #[test]
    fn base_url_is_normalised() {
        let service = HttpCollectionService::new("http://127.0.0.1:9/", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(
            service.url("dns-servers"),
            "http://127.0.0.1:9/collections/dns-servers"
        );
    }

    #[test]
    fn get_reads_the_whole_collection() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"ifindex":0,"domain":"a.example"},{"ifindex":2,"domain":"b.example"}]"#,
        );
        let service = HttpCollectionService::new(base, DEFAULT_TIMEOUT).unwrap();
        let items = service.get_collection("dns-domains").unwrap();
        let seen = server.join().unwrap();

        assert_eq!(seen.request_line, "GET /collections/dns-domains HTTP/1.1");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["domain"], "b.example");
    }

    #[test]
    fn put_sends_the_interface_and_payload() {
        let (base, server) = serve_once("204 No Content", "");
        let service = HttpCollectionService::new(format!("{base}/"), DEFAULT_TIMEOUT).unwrap();
        let items = vec![json!({"ifindex": 3, "family": 2, "address": [9, 9, 9, 9], "port": 53, "name": "q"})];
        service
            .set_collection("dns-servers", 3, items.clone())
            .unwrap();
        let seen = server.join().unwrap();

        assert_eq!(
            seen.request_line,
            "PUT /collections/dns-servers?ifindex=3 HTTP/1.1"
        );
        let body: Vec<Value> = serde_json::from_str(&seen.body).unwrap();
        assert_eq!(body, items);
    }

    #[test]
    fn non_success_status_is_rejected() {
        let (base, server) = serve_once("409 Conflict", "stale interface");
        let service = HttpCollectionService::new(base, DEFAULT_TIMEOUT).unwrap();
        let err = service
            .set_collection("dns-domains", 0, Vec::new())
            .unwrap_err();
        server.join().unwrap();

        match err {
            ServiceError::Rejected(reason) => {
                assert!(reason.contains("409"), "{reason}");
                assert!(reason.contains("stale interface"), "{reason}");
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn malformed_body_is_rejected() {
        let (base, server) = serve_once("200 OK", r#"{"not":"a list"}"#);
        let service = HttpCollectionService::new(base, DEFAULT_TIMEOUT).unwrap();
        let err = service.get_collection("dns-servers").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[test]
    fn closed_port_is_unreachable() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let service =
            HttpCollectionService::new(format!("http://127.0.0.1:{port}"), DEFAULT_TIMEOUT)
                .unwrap();
        assert!(matches!(
            service.get_collection("dns-servers"),
            Err(ServiceError::Unreachable(_))
        ));
    }
}
