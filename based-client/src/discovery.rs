//! Service discovery.
//!
//! Logical coordinates (cluster, org, project, env, service) are resolved to
//! a socket endpoint through an HTTP status request. The status host is
//! derived from a hash of the coordinates; the response carries an
//! obfuscated list of hubs and access keys in its `x-request-id` header.

use crate::connection::ReconnectConfig;
use crate::error::ClientError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_CLUSTER: &str = "production";
pub const DEFAULT_SERVICE: &str = "@based/env-hub";
pub const DEFAULT_DOMAIN: &str = "based.dev";

/// Cluster name that resolves to a status server on the local machine.
pub const LOCAL_CLUSTER: &str = "local";

const TOKEN_HEADER: &str = "x-request-id";
const SEQUENCE_HEADER: &str = "sequence-id";
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Length of the per-response substitution alphabet at the start of a token.
const ALPHABET_LEN: usize = 6;

const TOKEN_DICTIONARY: [&str; 21] = [
    ",",
    ".based.dev",
    "localhost:",
    "localhost",
    "based.io",
    "based.dev",
    "@based",
    "/env-hub",
    "admin",
    "hub",
    "900",
    "90",
    "443",
    "80",
    ":",
    "%",
    "/",
    "=",
    "<",
    "?",
    ".",
];

/// Where a client should connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCoordinates {
    pub cluster: String,
    pub org: String,
    pub project: String,
    pub env: String,
    /// Service name, one of the discoverable hubs.
    pub name: String,
    /// Access key appended to the socket URL path.
    pub key: Option<String>,
    /// Marks the key as optional for the hub.
    pub optional_key: bool,
    /// Host of the status server when `cluster` is `local`.
    pub host: Option<String>,
    /// Replaces the derived status URL.
    pub discovery_url: Option<String>,
    pub domain: String,
    /// Extra headers sent with the status request.
    pub headers: BTreeMap<String, String>,
    /// Use `wss://`/`https://` for the resolved endpoint.
    pub tls: bool,
    /// Verify the status server's certificate.
    pub verify_status_tls: bool,
}

impl Default for ServiceCoordinates {
    fn default() -> Self {
        Self {
            cluster: DEFAULT_CLUSTER.to_string(),
            org: String::new(),
            project: String::new(),
            env: String::new(),
            name: DEFAULT_SERVICE.to_string(),
            key: None,
            optional_key: false,
            host: None,
            discovery_url: None,
            domain: DEFAULT_DOMAIN.to_string(),
            headers: BTreeMap::new(),
            tls: true,
            verify_status_tls: false,
        }
    }
}

impl ServiceCoordinates {
    pub fn new(
        org: impl Into<String>,
        project: impl Into<String>,
        env: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
            env: env.into(),
            ..Self::default()
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>, optional: bool) -> Self {
        self.key = Some(key.into());
        self.optional_key = optional;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = Some(url.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Base URL of the status server for these coordinates.
    pub fn status_url(&self) -> String {
        if let Some(ref url) = self.discovery_url {
            return url.trim_end_matches('/').to_string();
        }
        if self.cluster == LOCAL_CLUSTER {
            let host = self.host.as_deref().unwrap_or("localhost");
            return format!(
                "http://{}:{}",
                host,
                local_port(&self.org, &self.project, &self.env)
            );
        }
        format!(
            "https://{}-status.{}",
            base36(hash_env(&self.org, &self.project, &self.env, &self.cluster)),
            self.domain
        )
    }
}

/// One hub returned by the status server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    /// URI-component encoded access key.
    pub key: String,
}

impl Endpoint {
    /// Socket URL, or the plain HTTP origin when `http` is set.
    pub fn url(&self, tls: bool, http: bool) -> String {
        match (http, tls) {
            (true, true) => format!("https://{}", self.host),
            (true, false) => format!("http://{}", self.host),
            (false, true) => format!("wss://{}/{}", self.host, self.key),
            (false, false) => format!("ws://{}/{}", self.host, self.key),
        }
    }
}

fn string_hash(s: &str, mut hash: u32) -> u32 {
    for b in s.bytes().rev() {
        hash = hash.wrapping_mul(33) ^ (b as i8 as i32 as u32);
    }
    hash
}

/// Hash of the environment coordinates used to name the status host.
pub fn hash_env(org: &str, project: &str, env: &str, cluster: &str) -> u64 {
    let fields = [
        "__len:41".to_string(),
        format!("cluster:{}", cluster),
        format!("env:{}", env),
        format!("org:{}", org),
        format!("project:{}", project),
    ];
    let (mut h1, mut h2) = (5381u32, 52711u32);
    for field in &fields {
        h1 = string_hash(field, h1);
        h2 = string_hash(field, h2);
    }
    (h1 as u64) * 4096 + h2 as u64
}

pub fn base36(mut value: u64) -> String {
    const CHARSET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut digits = Vec::new();
    loop {
        digits.push(CHARSET[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Port of the status server of a local cluster.
pub fn local_port(org: &str, project: &str, env: &str) -> u16 {
    let seed = format!(
        "allServices-{}-{}-{}-@based/env-hub-discovery-0",
        org, project, env
    );
    let mut hash: u64 = 5381;
    for b in seed.bytes().rev() {
        hash = hash.wrapping_mul(33) ^ (b as i8 as i64 as u64);
    }
    let mut port = hash as u32;
    while port > u16::MAX as u32 {
        port /= 10;
    }
    port as u16
}

/// Index of a discoverable service.
pub fn service_index(name: &str) -> Result<u8, ClientError> {
    match name {
        "@based/env-hub" => Ok(0),
        "@based/env-admin-hub" => Ok(1),
        "@based/admin-hub" => Ok(2),
        "@based/machine-hub" => Ok(3),
        other => Err(ClientError::UndiscoverableService(other.to_string())),
    }
}

/// Status request path: service index, random noise and the optional key.
pub fn cache_path<R: Rng>(coords: &ServiceCoordinates, rng: &mut R) -> Result<String, ClientError> {
    let index = service_index(&coords.name)?;
    let prefix = format!("{}{}", index, rng.gen_range(0..10_000));
    Ok(match coords.key {
        Some(ref key) if !key.is_empty() => {
            let marker = if coords.optional_key { "$" } else { "" };
            format!("{}/{}{}", prefix, key, marker)
        }
        _ => prefix,
    })
}

/// Decodes a status token. Returns `None` when it is malformed.
pub fn decode_token(token: &str) -> Option<String> {
    let alphabet: Vec<char> = token.chars().take(ALPHABET_LEN).collect();
    if alphabet.len() < ALPHABET_LEN {
        return None;
    }

    let mut out = String::new();
    let mut chars = token.chars().skip(ALPHABET_LEN);
    while let Some(c) = chars.next() {
        if !alphabet.contains(&c) {
            out.push(c);
            continue;
        }
        let index = match chars.next()? {
            k @ 'a'..='z' => k as usize - 'a' as usize,
            '0' => 26,
            _ => return None,
        };
        match TOKEN_DICTIONARY.get(index) {
            Some(word) => out.push_str(word),
            None => out.push(alphabet[index - TOKEN_DICTIONARY.len()]),
        }
    }
    Some(out)
}

/// Percent-encodes everything outside `A-Z a-z 0-9 ! ' ( ) * + , - . _ ~`.
pub fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(b as char),
            b'!' | b'\'' | b'(' | b')' | b'*'..=b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Splits a decoded token into endpoints: hosts first, then their keys.
pub fn parse_endpoints(decoded: &str) -> Vec<Endpoint> {
    let parts: Vec<&str> = decoded.split(',').collect();
    let half = parts.len() / 2;
    (0..half)
        .map(|i| Endpoint {
            host: parts[i].to_string(),
            key: encode_uri_component(parts[i + half]),
        })
        .collect()
}

/// HTTP client for status requests.
pub struct Resolver {
    http: reqwest::Client,
    backoff: ReconnectConfig,
}

impl Resolver {
    pub fn new(verify_tls: bool, backoff: ReconnectConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(STATUS_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self { http, backoff })
    }

    /// Resolves coordinates to an endpoint, retrying until it succeeds or a
    /// non-retryable error occurs.
    pub async fn resolve(&self, coords: &ServiceCoordinates) -> Result<Endpoint, ClientError> {
        let base = coords.status_url();
        let mut attempts = 0u32;
        loop {
            if attempts > 0 {
                tokio::time::sleep(self.backoff.delay(attempts)).await;
            }
            match self.request(&base, coords).await {
                Ok(endpoint) => {
                    tracing::debug!("discovered hub {}", endpoint.host);
                    return Ok(endpoint);
                }
                Err(e) if e.is_retryable() => {
                    attempts = attempts.saturating_add(1);
                    tracing::warn!("discovery via {} failed ({}), retrying", base, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request(
        &self,
        base: &str,
        coords: &ServiceCoordinates,
    ) -> Result<Endpoint, ClientError> {
        let (path, sequence) = {
            let mut rng = rand::thread_rng();
            (cache_path(coords, &mut rng)?, cache_path(coords, &mut rng)?)
        };

        let mut request = self
            .http
            .get(format!("{}/status/{}", base, path))
            .header(SEQUENCE_HEADER, sequence);
        for (name, value) in &coords.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ClientError::NoEndpoint)?;
        let decoded = decode_token(token).ok_or(ClientError::NoEndpoint)?;

        let mut endpoints = parse_endpoints(&decoded);
        if endpoints.is_empty() {
            return Err(ClientError::NoEndpoint);
        }
        let choice = rand::thread_rng().gen_range(0..endpoints.len());
        Ok(endpoints.swap_remove(choice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_string_hash_reference() {
        // h = 5381; "ab" from the end: (5381*33 ^ 'b') * 33 ^ 'a'
        let expected = ((5381u32.wrapping_mul(33) ^ 98).wrapping_mul(33)) ^ 97;
        assert_eq!(string_hash("ab", 5381), expected);
    }

    #[test]
    fn test_hash_env_deterministic() {
        let a = hash_env("org", "proj", "dev", "production");
        assert_eq!(a, hash_env("org", "proj", "dev", "production"));
        assert_ne!(a, hash_env("org", "proj", "prod", "production"));
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(u64::MAX), "3w5e11264sgsf");
    }

    #[test]
    fn test_status_urls() {
        let coords = ServiceCoordinates::new("o", "p", "e");
        let url = coords.status_url();
        assert!(url.starts_with("https://"));
        assert!(url.ends_with("-status.based.dev"));

        let local = ServiceCoordinates::new("o", "p", "e").with_cluster("local");
        assert_eq!(
            local.status_url(),
            format!("http://localhost:{}", local_port("o", "p", "e"))
        );

        let custom = coords.with_discovery_url("http://127.0.0.1:9000/");
        assert_eq!(custom.status_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_local_port_in_range() {
        for env in ["a", "dev", "production", "x-y-z"] {
            let port = local_port("org", "project", env);
            assert!(port > 0);
        }
    }

    #[test]
    fn test_service_index() {
        assert_eq!(service_index("@based/env-hub").unwrap(), 0);
        assert_eq!(service_index("@based/machine-hub").unwrap(), 3);
        assert!(matches!(
            service_index("@based/other"),
            Err(ClientError::UndiscoverableService(_))
        ));
    }

    #[test]
    fn test_cache_path() {
        let mut rng = StdRng::seed_from_u64(7);
        let coords = ServiceCoordinates::new("o", "p", "e").with_service("@based/admin-hub");
        let path = cache_path(&coords, &mut rng).unwrap();
        assert!(path.starts_with('2'));
        assert!(path[1..].parse::<u32>().unwrap() < 10_000);

        let keyed = coords.clone().with_key("secret", true);
        let path = cache_path(&keyed, &mut rng).unwrap();
        assert!(path.ends_with("/secret$"));

        let keyed = coords.with_key("secret", false);
        assert!(cache_path(&keyed, &mut rng).unwrap().ends_with("/secret"));
    }

    #[test]
    fn test_decode_token() {
        // alphabet "XYZQWJ"; Xb -> ".based.dev", Xa -> ","
        let decoded = decode_token("XYZQWJhub1XbXak1").unwrap();
        assert_eq!(decoded, "hub1.based.dev,k1");

        // keys past the dictionary map back to alphabet characters
        assert_eq!(decode_token("XYZQWJaXvbX0").unwrap(), "aXbJ");
        assert!(decode_token("XYZ").is_none());
        assert!(decode_token("XYZQWJabcX").is_none());
    }

    #[test]
    fn test_encode_uri_component() {
        assert_eq!(encode_uri_component("abc-1.2_~"), "abc-1.2_~");
        assert_eq!(encode_uri_component("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_uri_component("a+b,c"), "a+b,c");
        assert_eq!(encode_uri_component("é"), "%C3%A9");
    }

    #[test]
    fn test_parse_endpoints() {
        let endpoints = parse_endpoints("h1:90,h2:443,k 1,k2");
        assert_eq!(
            endpoints,
            vec![
                Endpoint {
                    host: "h1:90".into(),
                    key: "k%201".into()
                },
                Endpoint {
                    host: "h2:443".into(),
                    key: "k2".into()
                },
            ]
        );
        assert!(parse_endpoints("").is_empty());
        assert_eq!(endpoints[1].url(true, false), "wss://h2:443/k2");
        assert_eq!(endpoints[1].url(false, true), "http://h2:443");
    }

    async fn status_server(responses: Vec<Option<&'static str>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for token in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await.unwrap();
                let header = token
                    .map(|t| format!("x-request-id: {}\r\n", t))
                    .unwrap_or_default();
                let response = format!(
                    "HTTP/1.1 200 OK\r\n{}content-length: 0\r\nconnection: close\r\n\r\n",
                    header
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_resolve_retries_until_token() {
        let url = status_server(vec![None, Some("XYZQWJhub1XbXak1")]).await;
        let coords = ServiceCoordinates::new("o", "p", "e").with_discovery_url(url);
        let resolver = Resolver::new(false, ReconnectConfig::default()).unwrap();

        let endpoint = resolver.resolve(&coords).await.unwrap();
        assert_eq!(endpoint.host, "hub1.based.dev");
        assert_eq!(endpoint.key, "k1");
    }

    #[tokio::test]
    async fn test_resolve_undiscoverable_fails_fast() {
        let coords = ServiceCoordinates::new("o", "p", "e")
            .with_service("@based/unknown")
            .with_discovery_url("http://127.0.0.1:1");
        let resolver = Resolver::new(false, ReconnectConfig::default()).unwrap();
        assert!(matches!(
            resolver.resolve(&coords).await,
            Err(ClientError::UndiscoverableService(_))
        ));
    }
}
