use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const ENTRY_VERSION: &str = "1.0.0";

pub fn wait_for<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

pub fn can_bind_local_ports() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_http_runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("create test http runtime")
    })
}

/// Minimal HTTP/1.1 origin on a background thread.
///
/// `GET /` answers with a versioned entry page, `/redirect` with a 302, and
/// every other path echoes what the origin saw as plain text lines.
pub struct MockOrigin {
    pub addr: SocketAddr,
}

impl MockOrigin {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                thread::spawn(move || {
                    let _ = handle_origin_connection(stream);
                });
            }
        });
        Self { addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

fn handle_origin_connection(stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut host = String::new();
    let mut referer = String::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim().to_string();
            match name.to_ascii_lowercase().as_str() {
                "host" => host = value,
                "referer" => referer = value,
                "content-length" => content_length = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    let (status, extra, payload) = match target.as_str() {
        "/" => (
            "200 OK",
            "Content-Type: text/html\r\n",
            format!("<html><!-- dStore version {ENTRY_VERSION} --><body>store</body></html>"),
        ),
        "/redirect" => (
            "302 Found",
            "Location: /elsewhere\r\n",
            String::new(),
        ),
        _ => (
            "200 OK",
            "Content-Type: text/plain\r\n",
            format!(
                "method={method}\nhost={host}\nreferer={referer}\nbody={}\n",
                String::from_utf8_lossy(&body)
            ),
        ),
    };

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {status}\r\n{extra}Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    )?;
    stream.flush()
}

/// Self-signed bundle in the gateway's certificate layout.
pub fn write_self_signed_bundle(data_dir: &Path, domain: &str) {
    let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let dir = data_dir.join("cert").join(domain);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("privkey.pem"), key_pair.serialize_pem()).unwrap();
    fs::write(dir.join("cert.pem"), cert.pem()).unwrap();
    fs::write(dir.join("chain.pem"), cert.pem()).unwrap();
}

pub struct TestGateway {
    child: Option<Child>,
    pub http_port: u16,
    pub tls_port: u16,
    /// Lines the stub provisioning command was invoked with
    pub provision_log: PathBuf,
    data_dir: TempDir,
}

impl TestGateway {
    /// Start the gateway for `domain` against `origin`. The primary bundle is
    /// written up front; the provisioning command only records its argument
    /// and fails.
    pub fn start(domain: &str, origin: &MockOrigin) -> Self {
        let data_dir = TempDir::new().unwrap();
        write_self_signed_bundle(data_dir.path(), domain);

        let provision_log = data_dir.path().join("provisioned.log");
        let script = data_dir.path().join("provision.sh");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1\" >> \"{}\"\nexit 1\n",
                provision_log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let http_port = pick_port();
        let tls_port = pick_port();

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dstore-gateway"));
        cmd.args([
            "--domain",
            domain,
            "--data-dir",
            data_dir.path().to_string_lossy().as_ref(),
            "--port",
            &http_port.to_string(),
            "--tls-port",
            &tls_port.to_string(),
            "--origin",
            &origin.url(),
            "--pwa-fallback-url",
            &format!("{}/pwa.json", origin.url()),
            "--provision-command",
            script.to_string_lossy().as_ref(),
        ])
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
        let mut child = cmd.spawn().expect("failed to start dstore-gateway");

        let deadline = Instant::now() + Duration::from_secs(15);
        let mut startup_error: Option<String> = None;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                startup_error = Some(format!("dstore-gateway exited early: {}", status));
                break;
            }

            if TcpStream::connect(("127.0.0.1", http_port)).is_ok()
                && TcpStream::connect(("127.0.0.1", tls_port)).is_ok()
            {
                return Self {
                    child: Some(child),
                    http_port,
                    tls_port,
                    provision_log,
                    data_dir,
                };
            }

            thread::sleep(Duration::from_millis(100));
        }

        let _ = child.kill();
        let _ = child.wait();
        panic!(
            "{}",
            startup_error.unwrap_or_else(|| "dstore-gateway listeners never came up".to_string())
        );
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn http_accepts(&self) -> bool {
        TcpStream::connect(("127.0.0.1", self.http_port)).is_ok()
    }

    /// Raw HTTP/1.1 GET; returns the full response including the head, or
    /// whatever arrived before the connection dropped.
    pub fn http_get(&self, host: &str, path: &str) -> String {
        let Ok(mut stream) = TcpStream::connect(("127.0.0.1", self.http_port)) else {
            return String::new();
        };
        stream.set_read_timeout(Some(Duration::from_secs(10))).ok();

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        if stream.write_all(request.as_bytes()).is_err() {
            return String::new();
        }

        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn https_get(&self, host: &str, path: &str) -> Result<(u16, String), String> {
        let url = format!("https://{}:{}{}", host, self.tls_port, path);
        let resolve = SocketAddr::from(([127, 0, 0, 1], self.tls_port));
        let host = host.to_string();

        test_http_runtime().block_on(async move {
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .resolve(&host, resolve)
                .redirect(reqwest::redirect::Policy::none())
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| format!("https client error: {e}"))?;

            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| format!("https request error: {e}"))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| format!("https response body error: {e}"))?;
            Ok((status, body))
        })
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Status code from a raw HTTP response.
pub fn status_of(response: &str) -> Option<u16> {
    response.split_whitespace().nth(1)?.parse().ok()
}

/// Body of a raw HTTP response.
pub fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or_default()
}
