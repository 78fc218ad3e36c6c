//! Client for the authorization service ("UDS") and the per-worker
//! termination notifier.
//!
//! The service resolves tickets into backend endpoints and records the
//! byte counters when a tunnel ends. Both exchanges are plain GETs; the
//! reply to a resolution is a small JSON document.

use crate::{config::Config, consts, error::Error};
use async_trait::async_trait;
use log::{debug, error};
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;

/// Backend endpoint a ticket resolves to.
#[derive(Clone, Debug, Deserialize)]
pub struct TicketResponse {
    pub host: String,
    #[serde(deserialize_with = "port_from_string_or_int")]
    pub port: u16,
    /// Opaque id used to close out the session report; may be empty.
    #[serde(default)]
    pub notify: String,
}

// The service historically returns the port either as a number or as a
// decimal string.
fn port_from_string_or_int<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Int(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Int(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// The authorization exchanges the broker depends on.
///
/// A trait so tests can stand in for the HTTP service.
#[async_trait]
pub trait UdsApi: Send + Sync {
    /// Exchange a ticket for the backend it authorizes.
    async fn resolve(&self, ticket: &str, source_ip: &str) -> Result<TicketResponse, Error>;

    /// Report the final byte counters for a finished tunnel.
    async fn notify_end(&self, notify: &str, sent: u64, recv: u64) -> Result<(), Error>;
}

/// Production implementation over HTTP(S).
pub struct HttpUdsApi {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl HttpUdsApi {
    pub fn from_config(cfg: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(consts::USER_AGENT)
            .timeout(cfg.uds_timeout)
            .danger_accept_invalid_certs(!cfg.uds_verify_ssl)
            .build()?;
        Ok(HttpUdsApi {
            client,
            base: cfg.uds_server.trim_end_matches('/').to_string(),
            token: cfg.uds_token.clone(),
        })
    }

    /// `GET <base>/<ticket>/<msg>/<token>[?query]`, returning the body on 2xx.
    async fn get(&self, ticket: &str, msg: &str, query: &[(&str, String)]) -> Result<String, Error> {
        let url = format!("{}/{}/{}/{}", self.base, ticket, msg, self.token);
        let mut request = self.client.get(&url);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UdsRefused {
                status: status.as_u16(),
                // keep error bodies loggable
                body: body.chars().take(256).collect(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl UdsApi for HttpUdsApi {
    async fn resolve(&self, ticket: &str, source_ip: &str) -> Result<TicketResponse, Error> {
        let body = self.get(ticket, source_ip, &[]).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn notify_end(&self, notify: &str, sent: u64, recv: u64) -> Result<(), Error> {
        self.get(
            notify,
            "stop",
            &[("sent", sent.to_string()), ("recv", recv.to_string())],
        )
        .await?;
        Ok(())
    }
}

/// Final report of a finished tunnel, queued by the connection close path.
#[derive(Debug)]
pub struct Termination {
    pub notify: String,
    pub sent: u64,
    pub recv: u64,
    pub tunnel_id: String,
}

/// Drains a worker's termination queue, one report at a time.
///
/// Failures are logged and never retried; sequencing the reports bounds
/// the authorization load a single worker can generate.
pub async fn notifier(api: std::sync::Arc<dyn UdsApi>, mut queue: mpsc::Receiver<Termination>) {
    while let Some(termination) = queue.recv().await {
        debug!(
            "NOTIFY ({}) {} s:{} r:{}",
            termination.tunnel_id, termination.notify, termination.sent, termination.recv
        );
        if let Err(err) = api
            .notify_end(&termination.notify, termination.sent, termination.recv)
            .await
        {
            error!(
                "ERROR NOTIFYING END ({}) {}: {}",
                termination.tunnel_id, termination.notify, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn port_accepts_strings_and_numbers() {
        let r: TicketResponse =
            serde_json::from_str(r#"{"host":"10.0.0.1","port":"9999","notify":"ABCD"}"#).unwrap();
        assert_eq!(r.port, 9999);
        assert_eq!(r.host, "10.0.0.1");
        assert_eq!(r.notify, "ABCD");

        let r: TicketResponse =
            serde_json::from_str(r#"{"host":"10.0.0.1","port":3389,"notify":""}"#).unwrap();
        assert_eq!(r.port, 3389);
    }

    #[test]
    fn missing_notify_defaults_to_empty() {
        let r: TicketResponse =
            serde_json::from_str(r#"{"host":"backend","port":22}"#).unwrap();
        assert_eq!(r.notify, "");
    }

    #[test]
    fn garbage_ports_are_rejected() {
        assert!(
            serde_json::from_str::<TicketResponse>(r#"{"host":"h","port":"not-a-port"}"#).is_err()
        );
        assert!(serde_json::from_str::<TicketResponse>(r#"{"host":"h","port":99999}"#).is_err());
    }
}
