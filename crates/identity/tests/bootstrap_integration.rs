//! End-to-end bootstrap flows over a scripted transport.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;

use petrel_core::SettingsStore;
use petrel_identity::{
    encoding, BootstrapFailure, BootstrapProtocol, BootstrapState, DeviceIdentity, HttpResponse,
    SecureKeyStore, Transport, TransportError, TrustStore,
};

struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn enqueue(&self, path: &str, status: u16, body: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(HttpResponse {
                status,
                body: body.to_string().into_bytes(),
            });
    }

    fn enqueue_raw(&self, path: &str, status: u16, body: &[u8]) {
        self.responses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(HttpResponse {
                status,
                body: body.to_vec(),
            });
    }

    fn recorded(&self) -> Vec<(String, serde_json::Value)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), body));

        let mut responses = self.responses.lock().unwrap();
        for (path, queue) in responses.iter_mut() {
            if url.ends_with(path.as_str()) {
                if let Some(response) = queue.pop_front() {
                    return Ok(response);
                }
            }
        }
        Err(TransportError::Network(format!(
            "no scripted response for {url}"
        )))
    }
}

struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn post_json(
        &self,
        _url: &str,
        _body: serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(HttpResponse {
            status: 200,
            body: Vec::new(),
        })
    }
}

fn controller_cert(cn: &str) -> Vec<u8> {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, cn);
    params.self_signed(&key).unwrap().der().to_vec()
}

fn device_identity(dir: &Path) -> (DeviceIdentity, Arc<SecureKeyStore>) {
    let settings = SettingsStore::open(dir.join("settings.db")).unwrap();
    let keystore = Arc::new(SecureKeyStore::open(dir.join("keys")).unwrap());
    let identity = DeviceIdentity::load_or_create(&settings, &keystore).unwrap();
    (identity, keystore)
}

fn protocol(
    dir: &Path,
    transport: Arc<dyn Transport>,
    keystore: Arc<SecureKeyStore>,
    expected_issuer: Option<&str>,
) -> BootstrapProtocol {
    let trust_store = Arc::new(
        TrustStore::open(dir.join("trust"), expected_issuer.map(str::to_string)).unwrap(),
    );
    BootstrapProtocol::new(transport, keystore, trust_store)
}

#[tokio::test]
async fn happy_path_installs_controller_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());
    let cert_der = controller_cert("petrel-controller");

    let transport = ScriptedTransport::new();
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "abc123" }),
    );
    transport.enqueue(
        "/bootstrap/respond",
        200,
        serde_json::json!({ "certificate": encoding::to_base64(&cert_der) }),
    );

    let protocol = protocol(
        dir.path(),
        transport.clone(),
        keystore,
        Some("petrel-controller"),
    );
    let installed = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await
        .unwrap();

    assert_eq!(installed.der, cert_der);
    assert!(matches!(protocol.state(), BootstrapState::Installed { .. }));

    let requests = transport.recorded();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].0,
        "https://controller.example:8443/bootstrap/challenge"
    );
    assert_eq!(requests[0].1["uuid"], identity.uuid());
    assert_eq!(requests[0].1["public_key"], identity.public_key());

    // The signature sent back must verify over the challenge under the
    // device public key the controller has on file.
    assert_eq!(requests[1].1["uuid"], identity.uuid());
    let signature_der =
        encoding::from_base64(requests[1].1["signature"].as_str().unwrap()).unwrap();
    let spki = encoding::from_base64(identity.public_key()).unwrap();
    let verifying_key = VerifyingKey::from_public_key_der(&spki).unwrap();
    let signature = Signature::from_der(&signature_der).unwrap();
    assert!(verifying_key.verify(b"abc123", &signature).is_ok());
}

#[tokio::test]
async fn empty_challenge_fails_before_any_signing() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, _) = device_identity(dir.path());

    // A keystore without the device key: a signing attempt would surface as
    // SigningError, so a ProtocolError proves signing was never reached.
    let empty_keystore = Arc::new(SecureKeyStore::open(dir.path().join("other-keys")).unwrap());

    let transport = ScriptedTransport::new();
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "" }),
    );

    let protocol = protocol(dir.path(), transport.clone(), empty_keystore, None);
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(result, Err(BootstrapFailure::ProtocolError(_))));
    assert!(matches!(
        protocol.state(),
        BootstrapState::Failed {
            reason: BootstrapFailure::ProtocolError(_),
            ..
        }
    ));
    assert_eq!(transport.recorded().len(), 1);
}

#[tokio::test]
async fn malformed_challenge_body_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());

    let transport = ScriptedTransport::new();
    transport.enqueue_raw("/bootstrap/challenge", 200, b"not json at all");

    let protocol = protocol(dir.path(), transport, keystore, None);
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(result, Err(BootstrapFailure::ProtocolError(_))));
}

#[tokio::test]
async fn controller_rejection_surfaces_as_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());

    let transport = ScriptedTransport::new();
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "abc123" }),
    );
    transport.enqueue("/bootstrap/respond", 403, serde_json::json!({}));

    let protocol = protocol(dir.path(), transport, keystore, None);
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(result, Err(BootstrapFailure::Rejected(_))));
    assert!(matches!(
        protocol.state(),
        BootstrapState::Failed {
            reason: BootstrapFailure::Rejected(_),
            ..
        }
    ));
}

#[tokio::test]
async fn invalid_certificate_is_never_installed() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());

    let transport = ScriptedTransport::new();
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "abc123" }),
    );
    transport.enqueue(
        "/bootstrap/respond",
        200,
        serde_json::json!({ "certificate": encoding::to_base64(b"CERT_BLOB") }),
    );

    let trust_dir = dir.path().join("trust");
    let protocol = protocol(dir.path(), transport, keystore, None);
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(
        result,
        Err(BootstrapFailure::InvalidCertificate(_))
    ));
    let trust_store = TrustStore::open(trust_dir, None).unwrap();
    assert!(trust_store.installed().unwrap().is_none());
}

#[tokio::test]
async fn wrong_issuer_certificate_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());
    let rogue_der = controller_cert("rogue-controller");

    let transport = ScriptedTransport::new();
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "abc123" }),
    );
    transport.enqueue(
        "/bootstrap/respond",
        200,
        serde_json::json!({ "certificate": encoding::to_base64(&rogue_der) }),
    );

    let protocol = protocol(
        dir.path(),
        transport,
        keystore,
        Some("petrel-controller"),
    );
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(
        result,
        Err(BootstrapFailure::InvalidCertificate(_))
    ));
}

#[tokio::test]
async fn unreachable_controller_is_a_network_error() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());

    // Nothing scripted: every request fails at the transport.
    let transport = ScriptedTransport::new();

    let protocol = protocol(dir.path(), transport, keystore, None);
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(result, Err(BootstrapFailure::NetworkError(_))));
}

#[tokio::test(start_paused = true)]
async fn timeout_does_not_advance_past_challenge_requested() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());

    let protocol = protocol(dir.path(), Arc::new(StalledTransport), keystore, None)
        .with_timeout(Duration::from_millis(250));
    let result = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;

    assert!(matches!(result, Err(BootstrapFailure::Timeout(250))));
    assert!(matches!(
        protocol.state(),
        BootstrapState::Failed {
            reason: BootstrapFailure::Timeout(_),
            ..
        }
    ));

    let history = protocol.history();
    assert!(history
        .iter()
        .all(|transition| transition.to_state != "ChallengeReceived"));
    assert_eq!(history.last().unwrap().from_state, "ChallengeRequested");
}

#[tokio::test]
async fn concurrent_attempts_share_one_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());
    let cert_der = controller_cert("petrel-controller");

    // Exactly one scripted exchange: a second live attempt would hit an
    // unscripted endpoint and fail.
    let transport = ScriptedTransport::new();
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "abc123" }),
    );
    transport.enqueue(
        "/bootstrap/respond",
        200,
        serde_json::json!({ "certificate": encoding::to_base64(&cert_der) }),
    );

    let protocol = Arc::new(protocol(
        dir.path(),
        transport.clone(),
        keystore,
        Some("petrel-controller"),
    ));

    let (first, second) = tokio::join!(
        protocol.bootstrap_now(&identity, "controller.example", 8443),
        protocol.bootstrap_now(&identity, "controller.example", 8443),
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.serial, second.serial);
    assert_eq!(first.der, cert_der);
    assert_eq!(transport.recorded().len(), 2);
}

#[tokio::test]
async fn failed_attempt_can_be_retried_by_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, keystore) = device_identity(dir.path());
    let cert_der = controller_cert("petrel-controller");

    let transport = ScriptedTransport::new();
    // First attempt: controller rejects. Second attempt: full exchange.
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "first" }),
    );
    transport.enqueue("/bootstrap/respond", 401, serde_json::json!({}));
    transport.enqueue(
        "/bootstrap/challenge",
        200,
        serde_json::json!({ "challenge": "second" }),
    );
    transport.enqueue(
        "/bootstrap/respond",
        200,
        serde_json::json!({ "certificate": encoding::to_base64(&cert_der) }),
    );

    let protocol = protocol(
        dir.path(),
        transport,
        keystore,
        Some("petrel-controller"),
    );

    let first = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await;
    assert!(matches!(first, Err(BootstrapFailure::Rejected(_))));

    let second = protocol
        .bootstrap_now(&identity, "controller.example", 8443)
        .await
        .unwrap();
    assert_eq!(second.der, cert_der);
    assert!(matches!(protocol.state(), BootstrapState::Installed { .. }));
}
