mod support;

use std::fs;
use std::time::Duration;

use support::{
    ENTRY_VERSION, MockOrigin, TestGateway, body_of, can_bind_local_ports, status_of, wait_for,
};

const DOMAIN: &str = "shop.test";

#[test]
fn startup_syncs_entry_page_and_creates_apps_manifest() {
    if !can_bind_local_ports() {
        return;
    }
    let origin = MockOrigin::start();
    let gateway = TestGateway::start(DOMAIN, &origin);

    let entry = fs::read_to_string(gateway.data_dir().join("dstore.html")).unwrap();
    assert!(entry.contains(&format!("dStore version {ENTRY_VERSION}")));

    let response = gateway.http_get(DOMAIN, "/");
    assert_eq!(status_of(&response), Some(200), "{response}");
    assert!(response.contains("<body>store</body>"));

    let response = gateway.http_get(DOMAIN, "/apps.json");
    assert_eq!(status_of(&response), Some(200), "{response}");
    assert_eq!(body_of(&response), "{}");

    fs::remove_file(gateway.data_dir().join("apps.json")).unwrap();
    let response = gateway.http_get(DOMAIN, "/apps.json");
    assert_eq!(status_of(&response), Some(404), "{response}");
    assert_eq!(body_of(&response), "File not found");
}

#[test]
fn other_paths_are_proxied_to_origin() {
    if !can_bind_local_ports() {
        return;
    }
    let origin = MockOrigin::start();
    let gateway = TestGateway::start(DOMAIN, &origin);

    let response = gateway.http_get("mirror.example", "/api/items?page=2");
    assert_eq!(status_of(&response), Some(200), "{response}");
    assert!(response.contains("method=GET"), "{response}");
    assert!(response.contains(&format!("host={}", origin.addr)), "{response}");
    assert!(
        response.contains("referer=http://mirror.example/api/items?page=2"),
        "{response}"
    );

    let response = gateway.http_get("mirror.example", "/redirect");
    assert_eq!(status_of(&response), Some(302), "{response}");
    assert!(
        response.to_ascii_lowercase().contains("location: /elsewhere"),
        "{response}"
    );
}

#[test]
fn https_listener_serves_primary_domain() {
    if !can_bind_local_ports() {
        return;
    }
    let origin = MockOrigin::start();
    let gateway = TestGateway::start(DOMAIN, &origin);

    let (status, body) = gateway.https_get(DOMAIN, "/apps.json").unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "{}");

    let (status, body) = gateway.https_get(DOMAIN, "/api/ping").unwrap();
    assert_eq!(status, 200);
    // Host carries the non-default port, so the referer does too
    let referer = format!("referer=https://{DOMAIN}:{}/api/ping", gateway.tls_port);
    assert!(body.contains(&referer), "{body}");
}

#[test]
fn recognized_host_pauses_plaintext_while_provisioning() {
    if !can_bind_local_ports() {
        return;
    }
    let origin = MockOrigin::start();
    let gateway = TestGateway::start(DOMAIN, &origin);
    let host = "store.newshop.test";

    // The triggering request may or may not complete before the pause
    let _ = gateway.http_get(host, "/apps.json");

    let provisioned = wait_for(Duration::from_secs(10), || {
        fs::read_to_string(&gateway.provision_log)
            .map(|log| log.lines().any(|line| line == host))
            .unwrap_or(false)
    });
    assert!(provisioned, "provisioning command was never invoked for {host}");

    // Plaintext stays down for the settle delay after the command exits
    assert!(!gateway.http_accepts(), "HTTP listener still accepting");

    // TLS keeps serving meanwhile
    let (status, _) = gateway.https_get(DOMAIN, "/apps.json").unwrap();
    assert_eq!(status, 200);

    assert!(
        wait_for(Duration::from_secs(30), || gateway.http_accepts()),
        "HTTP listener never came back"
    );
    let response = gateway.http_get(DOMAIN, "/apps.json");
    assert_eq!(status_of(&response), Some(200), "{response}");

    // Failed provisioning never adds the host to the known list
    let known = fs::read_to_string(gateway.data_dir().join("domains.txt")).unwrap_or_default();
    assert!(!known.lines().any(|line| line == host));
}
