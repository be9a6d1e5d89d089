// crates/curlew-management/tests/client_unit.rs
// ============================================================================
// Module: Management Client Unit Tests
// Description: Request/response behavior against a one-shot local server.
// Purpose: Validate registration, tuple handling, and token caching.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::thread;

use curlew_core::AssetTrackerApi;
use curlew_core::AssetTrackingTuple;
use curlew_management::ManagementClient;
use curlew_management::ManagementClientConfig;
use curlew_management::ServiceRecord;

// ============================================================================
// SECTION: One-Shot Server
// ============================================================================

/// Serves exactly one HTTP request with a canned JSON body, returning the
/// base URL and a handle resolving to the raw request text.
fn serve_once(body: &'static str) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut raw = Vec::new();
        let mut buffer = [0_u8; 4096];
        loop {
            let read = stream.read(&mut buffer).expect("read");
            raw.extend_from_slice(&buffer[.. read]);
            if request_complete(&raw) || read == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).expect("write");
        String::from_utf8_lossy(&raw).to_string()
    });
    (format!("http://{address}"), handle)
}

/// True once the headers plus any Content-Length body have arrived.
fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    raw.len() >= header_end + 4 + content_length
}

fn client_for(base_url: &str) -> ManagementClient {
    ManagementClient::new(&ManagementClientConfig {
        base_url: base_url.to_string(),
        timeout_ms: 2_000,
    })
    .expect("client")
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn registration_retains_the_assigned_identity() {
    let (url, server) = serve_once("{\"id\": \"svc-uuid-1\", \"bearer_token\": \"tok\"}");
    let client = client_for(&url);
    let record = ServiceRecord {
        name: "south-1".to_string(),
        service_type: "Southbound".to_string(),
        protocol: "http".to_string(),
        address: "127.0.0.1".to_string(),
        service_port: 6683,
        management_port: 6684,
    };
    client.register_service(&record).expect("register");
    assert_eq!(client.uuid().as_deref(), Some("svc-uuid-1"));
    let request = server.join().expect("request");
    assert!(request.starts_with("POST /fledge/service "));
    assert!(request.contains("\"type\":\"Southbound\""));
}

#[test]
fn tuples_are_filtered_by_event() {
    let (url, server) = serve_once(
        "{\"track\": [\
         {\"service\": \"svc\", \"plugin\": \"plg\", \"asset\": \"pump\", \"event\": \"Ingest\"},\
         {\"service\": \"svc\", \"plugin\": \"plg\", \"asset\": \"valve\", \"event\": \"Egress\"}\
         ]}",
    );
    let client = client_for(&url);
    let tuples = client.tuples("svc", "Ingest").expect("tuples");
    assert_eq!(tuples.len(), 1);
    assert_eq!(tuples[0].asset, "pump");
    let request = server.join().expect("request");
    assert!(request.starts_with("GET /fledge/track?service=svc "));
}

#[test]
fn recording_a_tuple_posts_the_full_record() {
    let (url, server) = serve_once("{\"fledge\": \"ok\"}");
    let client = client_for(&url);
    let tuple = AssetTrackingTuple::ingest("svc", "plg", "pump");
    client.record_tuple(&tuple).expect("record");
    let request = server.join().expect("request");
    assert!(request.starts_with("POST /fledge/track "));
    assert!(request.contains("\"asset\":\"pump\""));
    assert!(request.contains("\"event\":\"Ingest\""));
}

#[test]
fn api_message_bodies_surface_as_errors() {
    let (url, _server) = serve_once("{\"message\": \"no such service\"}");
    let client = client_for(&url);
    assert!(client.get_service("ghost").is_err());
}

#[test]
fn verified_tokens_are_served_from_the_cache() {
    let (url, server) = serve_once(
        "{\"aud\": \"svc\", \"sub\": \"caller\", \"iss\": \"core\", \"exp\": 2000000000}",
    );
    let client = client_for(&url);
    let first = client.verify_access_bearer_token("token-1").expect("verify");
    assert_eq!(first.sub, "caller");
    server.join().expect("request");
    // The server is gone; only the cache can answer this one.
    let second = client.verify_access_bearer_token("token-1").expect("cached verify");
    assert_eq!(second, first);
}
