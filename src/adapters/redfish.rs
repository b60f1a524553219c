//! Remote-management boot over Redfish
//!
//! Requests go straight to the controller's HTTPS API against the iDRAC
//! resource paths. Bodies are built as JSON values and error answers are
//! parsed for the controller's own message. Credentials only ever travel in
//! the basic-auth header.

use reqwest::blocking::Client;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use cda_core_resilience::{Poll, PollConfig, PollError, PollLoop};

use crate::config::{BmcConfig, TimingConfig};
use crate::error::{CdaError, Result};
use crate::services::BootController;

const MANAGER: &str = "/redfish/v1/Managers/iDRAC.Embedded.1";
const SYSTEM: &str = "/redfish/v1/Systems/System.Embedded.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Status and raw body of one Redfish answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedfishResponse {
    pub status: u16,
    pub body: String,
}

impl RedfishResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request to a controller
///
/// An `Err` means no answer came back at all.
pub trait RedfishTransport: Send + Sync {
    fn send(&self, bmc: &BmcConfig, method: Method, path: &str, body: &Value)
        -> Result<RedfishResponse>;
}

/// HTTPS transport; controllers ship self-signed certificates
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CdaError::Boot(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl RedfishTransport for HttpTransport {
    fn send(
        &self,
        bmc: &BmcConfig,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<RedfishResponse> {
        let url = format!("https://{}{}", bmc.address, path);
        let response = self
            .client
            .request(method.clone(), &url)
            .basic_auth(&bmc.user, Some(bmc.password.expose_secret()))
            .json(body)
            .send()
            .map_err(|e| CdaError::Boot(format!("{} {}: {}", method, url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| CdaError::Boot(format!("{} {}: unreadable answer: {}", method, url, e)))?;
        Ok(RedfishResponse { status, body })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(rename = "@Message.ExtendedInfo", default)]
    extended_info: Vec<ExtendedInfo>,
}

#[derive(Debug, Deserialize)]
struct ExtendedInfo {
    #[serde(rename = "Message", default)]
    message: String,
}

/// The controller's explanation of a failed request
fn error_message(response: &RedfishResponse) -> String {
    match serde_json::from_str::<ErrorDocument>(&response.body) {
        Ok(doc) => doc
            .error
            .extended_info
            .into_iter()
            .map(|i| i.message)
            .find(|m| !m.is_empty())
            .unwrap_or(doc.error.message),
        Err(_) => response.body.trim().to_string(),
    }
}

pub struct RedfishBoot {
    transport: Arc<dyn RedfishTransport>,
    retries: u32,
    retry_delay: Duration,
}

impl RedfishBoot {
    pub fn new(timing: &TimingConfig) -> Result<Self> {
        Ok(Self::with_transport(Arc::new(HttpTransport::new()?), timing))
    }

    pub fn with_transport(transport: Arc<dyn RedfishTransport>, timing: &TimingConfig) -> Self {
        Self {
            transport,
            retries: timing.boot_retries,
            retry_delay: timing.boot_retry_delay(),
        }
    }

    /// Issue one request, returning whether it got a 2xx answer
    fn request(&self, bmc: &BmcConfig, method: Method, path: &str, body: Value) -> bool {
        match self.transport.send(bmc, method.clone(), path, &body) {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                warn!(
                    "{} {} on {} failed ({}): {}",
                    method,
                    path,
                    bmc.address,
                    response.status,
                    error_message(&response)
                );
                false
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn boot_once(&self, bmc: &BmcConfig, iso_url: &str) -> bool {
        let media = format!("{}/VirtualMedia/CD/Actions/VirtualMedia", MANAGER);
        // Nothing to eject on a fresh controller
        self.request(bmc, Method::POST, &format!("{}.EjectMedia", media), json!({}));
        self.request(
            bmc,
            Method::POST,
            &format!("{}.InsertMedia", media),
            json!({ "Image": iso_url }),
        ) && self.request(
            bmc,
            Method::PATCH,
            SYSTEM,
            json!({ "Boot": { "BootSourceOverrideTarget": "Cd", "BootSourceOverrideEnabled": "Once" } }),
        ) && self.request(
            bmc,
            Method::POST,
            &format!("{}/Actions/ComputerSystem.Reset", SYSTEM),
            json!({ "ResetType": "ForceRestart" }),
        )
    }
}

impl BootController for RedfishBoot {
    fn boot_iso(&self, bmc: &BmcConfig, iso_url: &str) -> Result<()> {
        info!("Booting {} from {}", bmc.address, iso_url);
        let poll = PollConfig::every(self.retry_delay)
            .with_max_attempts(Some(u64::from(self.retries.max(1))));
        let result = PollLoop::new(poll).run(|attempt| -> Result<Poll<()>> {
            if attempt > 0 {
                info!("Retrying boot of {} (attempt {})", bmc.address, attempt + 1);
            }
            if self.boot_once(bmc, iso_url) {
                Ok(Poll::Ready(()))
            } else {
                Ok(Poll::Pending)
            }
        });
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Aborted(e)) => Err(e),
            Err(e) => Err(CdaError::Boot(format!(
                "{} did not boot {}: {}",
                bmc.address, iso_url, e
            ))),
        }
    }

    /// Waits the retry delay between the two resets
    fn power_cycle(&self, bmc: &BmcConfig) -> Result<()> {
        info!("Power cycling {}", bmc.address);
        let reset = format!("{}/Actions/ComputerSystem.Reset", SYSTEM);
        for (i, kind) in ["ForceOff", "On"].into_iter().enumerate() {
            if i > 0 && !self.retry_delay.is_zero() {
                thread::sleep(self.retry_delay);
            }
            if !self.request(bmc, Method::POST, &reset, json!({ "ResetType": kind })) {
                return Err(CdaError::Boot(format!("{} refused reset {}", bmc.address, kind)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every request; paths containing a failing pattern get a 500
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Method, String, Value, String)>>,
        failing: Mutex<Vec<String>>,
        unreachable: bool,
    }

    impl Recorder {
        fn fail(&self, pattern: &str) {
            self.failing.lock().unwrap().push(pattern.to_string());
        }

        fn sent(&self) -> Vec<(Method, String, Value, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl RedfishTransport for Recorder {
        fn send(
            &self,
            bmc: &BmcConfig,
            method: Method,
            path: &str,
            body: &Value,
        ) -> Result<RedfishResponse> {
            self.sent.lock().unwrap().push((
                method,
                path.to_string(),
                body.clone(),
                bmc.password.expose_secret().to_string(),
            ));
            if self.unreachable {
                return Err(CdaError::Boot("connection refused".into()));
            }
            if self.failing.lock().unwrap().iter().any(|p| path.contains(p.as_str())) {
                return Ok(RedfishResponse {
                    status: 500,
                    body: r#"{"error": {"message": "General error", "@Message.ExtendedInfo": [{"Message": "Virtual media busy"}]}}"#.into(),
                });
            }
            Ok(RedfishResponse {
                status: 204,
                body: String::new(),
            })
        }
    }

    fn bmc() -> BmcConfig {
        BmcConfig {
            address: "10.1.1.5".into(),
            user: "root".into(),
            password: "calvin".into(),
        }
    }

    fn boot(retries: u32, transport: Arc<Recorder>) -> RedfishBoot {
        let mut timing = TimingConfig::immediate();
        timing.boot_retries = retries;
        RedfishBoot::with_transport(transport, &timing)
    }

    #[test]
    fn test_boot_sequence() {
        let transport = Arc::new(Recorder::default());
        boot(3, Arc::clone(&transport))
            .boot_iso(&bmc(), "http://192.168.122.1/c1.iso")
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].1.ends_with("EjectMedia"));
        assert!(sent[1].1.ends_with("InsertMedia"));
        assert_eq!(sent[1].2, json!({"Image": "http://192.168.122.1/c1.iso"}));
        assert_eq!(sent[2].0, Method::PATCH);
        assert_eq!(sent[2].2["Boot"]["BootSourceOverrideEnabled"], "Once");
        assert_eq!(sent[3].2, json!({"ResetType": "ForceRestart"}));
        assert!(sent.iter().all(|s| s.3 == "calvin"));
    }

    #[test]
    fn test_image_url_is_escaped() {
        let transport = Arc::new(Recorder::default());
        let url = r#"http://h/c1.iso?x="y"\z"#;
        boot(1, Arc::clone(&transport)).boot_iso(&bmc(), url).unwrap();
        let insert = &transport.sent()[1].2;
        assert_eq!(insert["Image"], url);
        assert_eq!(insert.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_boot_gives_up_after_retries() {
        let transport = Arc::new(Recorder::default());
        transport.fail("InsertMedia");
        let err = boot(2, Arc::clone(&transport))
            .boot_iso(&bmc(), "http://x/c1.iso")
            .unwrap_err();
        assert!(matches!(err, CdaError::Boot(_)));

        let sent = transport.sent();
        assert_eq!(sent.iter().filter(|s| s.1.ends_with("InsertMedia")).count(), 2);
        assert!(!sent.iter().any(|s| s.1.ends_with("ComputerSystem.Reset")));
    }

    #[test]
    fn test_unreachable_controller_is_retried() {
        let transport = Arc::new(Recorder {
            unreachable: true,
            ..Default::default()
        });
        let err = boot(3, Arc::clone(&transport))
            .boot_iso(&bmc(), "http://x/c1.iso")
            .unwrap_err();
        assert!(matches!(err, CdaError::Boot(_)));
        assert_eq!(transport.sent().iter().filter(|s| s.1.ends_with("InsertMedia")).count(), 3);
    }

    #[test]
    fn test_power_cycle_turns_off_then_on() {
        let transport = Arc::new(Recorder::default());
        boot(1, Arc::clone(&transport)).power_cycle(&bmc()).unwrap();
        let bodies: Vec<Value> = transport.sent().into_iter().map(|s| s.2).collect();
        assert_eq!(
            bodies,
            vec![json!({"ResetType": "ForceOff"}), json!({"ResetType": "On"})]
        );
    }

    #[test]
    fn test_power_cycle_stops_when_off_is_refused() {
        let transport = Arc::new(Recorder::default());
        transport.fail("ComputerSystem.Reset");
        let err = boot(1, Arc::clone(&transport)).power_cycle(&bmc()).unwrap_err();
        assert!(err.to_string().contains("ForceOff"));
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_error_message_prefers_extended_info() {
        let response = RedfishResponse {
            status: 400,
            body: r#"{"error": {"message": "General error", "@Message.ExtendedInfo": [{"Message": "Media busy"}]}}"#.into(),
        };
        assert_eq!(error_message(&response), "Media busy");

        let response = RedfishResponse {
            status: 400,
            body: r#"{"error": {"message": "General error"}}"#.into(),
        };
        assert_eq!(error_message(&response), "General error");

        let response = RedfishResponse {
            status: 502,
            body: " Bad gateway \n".into(),
        };
        assert_eq!(error_message(&response), "Bad gateway");
        assert!(!response.is_success());
    }
}
