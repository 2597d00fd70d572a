use std::sync::{Arc, Mutex};
use std::time::Duration;

use ovnstack::ovnstack::cni::metadata::{wait_for_pod_network, HttpMetadataResolver};
use ovnstack::ovnstack::cni::types::CniErrorReply;
use ovnstack::ovnstack::error::OverlayError;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves one canned response per connection, repeating the last one, and
/// records each request line.
async fn api_stub(responses: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buffer = vec![0u8; 8192];
            let read = socket.read(&mut buffer).await.unwrap_or(0);
            let head = String::from_utf8_lossy(&buffer[..read]).to_string();
            seen.lock()
                .unwrap()
                .push(head.lines().next().unwrap_or_default().to_string());

            let (status, body) = responses[index.min(responses.len() - 1)].clone();
            index += 1;
            let reason = if status == 200 { "OK" } else { "Error" };
            let reply = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("127.0.0.1:{port}"), requests)
}

fn pod(annotations: serde_json::Value) -> (u16, String) {
    (
        200,
        json!({"metadata": {"name": "web", "namespace": "default", "annotations": annotations}})
            .to_string(),
    )
}

fn assigned() -> serde_json::Value {
    json!({
        "ovn": {
            "mac_address": "0a:58:0a:01:01:05",
            "ip_address": "10.1.1.5/24",
            "gateway_ip": "10.1.1.1"
        }
    })
}

#[tokio::test]
async fn polls_until_the_annotation_appears() {
    let (server, requests) = api_stub(vec![
        pod(json!({})),
        pod(json!({"unrelated": "x"})),
        pod(assigned()),
    ])
    .await;
    let resolver = HttpMetadataResolver::new(&server).expect("resolver");

    let network = wait_for_pod_network(&resolver, "default", "web", 5, Duration::from_millis(5))
        .await
        .expect("annotation found");
    assert_eq!(network.mac, "0a:58:0a:01:01:05");
    assert_eq!(network.address.to_string(), "10.1.1.5/24");
    assert_eq!(network.gateway.to_string(), "10.1.1.1");

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].starts_with("GET /api/v1/namespaces/default/pods/web "));
}

#[tokio::test]
async fn gives_up_after_the_configured_attempts() {
    let (server, requests) = api_stub(vec![pod(json!({}))]).await;
    let resolver = HttpMetadataResolver::new(&server).expect("resolver");

    let err = wait_for_pod_network(&resolver, "default", "web", 3, Duration::from_millis(5))
        .await
        .expect_err("timeout");
    match &err {
        OverlayError::MetadataTimeout {
            namespace,
            pod,
            attempts,
        } => {
            assert_eq!((namespace.as_str(), pod.as_str(), *attempts), ("default", "web", 3));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(requests.lock().unwrap().len(), 3);
    assert_eq!(CniErrorReply::from_error("0.3.1", &err).code, 11);
}

#[tokio::test]
async fn api_errors_are_not_retried() {
    let (server, requests) = api_stub(vec![(404, "{\"kind\":\"Status\"}".to_string())]).await;
    let resolver = HttpMetadataResolver::new(&format!("http://{server}/")).expect("resolver");

    let err = wait_for_pod_network(&resolver, "default", "web", 5, Duration::from_millis(5))
        .await
        .expect_err("not found");
    assert_eq!(err.kind(), "metadata");
    assert!(err.to_string().contains("404"));
    assert_eq!(requests.lock().unwrap().len(), 1);
    assert_eq!(CniErrorReply::from_error("0.3.1", &err).code, 100);
}

#[tokio::test]
async fn string_encoded_annotations_are_accepted() {
    let encoded = assigned()["ovn"].to_string();
    let (server, _requests) = api_stub(vec![pod(json!({ "ovn": encoded }))]).await;
    let resolver = HttpMetadataResolver::new(&server).expect("resolver");

    let network = wait_for_pod_network(&resolver, "default", "web", 1, Duration::from_millis(5))
        .await
        .expect("annotation found");
    assert_eq!(network.address.to_string(), "10.1.1.5/24");
}
