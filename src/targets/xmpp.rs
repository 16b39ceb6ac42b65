//! XMPP delivery backend.
//!
//! Keeps one authenticated session per target. Every `execute` probes the
//! session with an XEP-0199 ping first; a failed probe, or a lost connection
//! while sending on a session that passed the probe, triggers exactly one
//! reconnect followed by one resend.
//!
//! Target args: `server` (host:port), `tls` (must be true), `username` (JID),
//! `password`. Per-message args: `destination` (JID).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_xmpp::parsers::iq::Iq;
use tokio_xmpp::parsers::message::{Body, Message as Stanza, MessageType};
use tokio_xmpp::parsers::ping::Ping;
use tokio_xmpp::parsers::{Element, Jid};
use tokio_xmpp::{AsyncClient, AsyncConfig, AsyncServerConfig, Event};
use uuid::Uuid;

use super::{arg_bool, required_arg, Backend, BackendError, TargetKind};
use crate::message::Message;
use crate::metrics::XMPP_RECONNECTS_TOTAL;
use crate::tenant::{Target, TargetArgs};

const DEFAULT_PORT: u16 = 5222;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters handed to a [`ChatConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppSettings {
    pub host: String,
    pub port: u16,
    pub jid: String,
    pub password: String,
}

impl XmppSettings {
    pub fn from_args(args: &TargetArgs) -> Result<Self, BackendError> {
        let server = required_arg(args, "server")?;
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| BackendError::Config(format!("invalid port in server: {}", server)))?;
                (host.to_string(), port)
            }
            None => (server.clone(), DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(BackendError::Config(format!("invalid server: {}", server)));
        }

        // tokio-xmpp always negotiates STARTTLS
        if !arg_bool(args, "tls", true)? {
            return Err(BackendError::Config(
                "plaintext XMPP connections are not supported".to_string(),
            ));
        }

        let jid = required_arg(args, "username")?;
        Jid::from_str(&jid)
            .map_err(|e| BackendError::Config(format!("invalid username {}: {}", jid, e)))?;

        Ok(Self {
            host,
            port,
            jid,
            password: required_arg(args, "password")?,
        })
    }
}

/// Opens authenticated chat sessions.
#[async_trait]
pub trait ChatConnector: Send + Sync {
    async fn connect(&self, settings: &XmppSettings) -> Result<Box<dyn ChatSession>, BackendError>;
}

/// An established chat session.
#[async_trait]
pub trait ChatSession: Send {
    /// Round-trip a ping to the server.
    async fn ping(&mut self) -> Result<(), BackendError>;

    async fn send_chat(&mut self, to: &str, body: &str) -> Result<(), BackendError>;

    async fn close(&mut self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Connected,
    Disconnected,
}

pub struct XmppBackend {
    target_id: String,
    args: TargetArgs,
    connector: Arc<dyn ChatConnector>,
    settings: Option<XmppSettings>,
    session: Option<Box<dyn ChatSession>>,
    reconnects: u64,
}

impl XmppBackend {
    pub fn new(target: &Target, connector: Arc<dyn ChatConnector>) -> Self {
        Self {
            target_id: target.id.clone(),
            args: target.args.clone(),
            connector,
            settings: None,
            session: None,
            reconnects: 0,
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        if self.session.is_some() {
            ConnectionHealth::Connected
        } else {
            ConnectionHealth::Disconnected
        }
    }

    /// Reconnects performed by `execute` since construction.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    async fn connect(&mut self) -> Result<(), BackendError> {
        let settings = self.settings.as_ref().ok_or(BackendError::NotReady("load"))?;
        let session = self.connector.connect(settings).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), BackendError> {
        if let Some(mut stale) = self.session.take() {
            if let Err(e) = stale.close().await {
                tracing::debug!(target_id = %self.target_id, error = %e, "Closing stale XMPP session");
            }
        }

        self.reconnects += 1;
        XMPP_RECONNECTS_TOTAL.inc();
        tracing::info!(target_id = %self.target_id, "Reconnecting XMPP session");

        self.connect().await
    }

    async fn send(&mut self, to: &str, body: &str) -> Result<(), BackendError> {
        match self.session.as_mut() {
            Some(session) => session.send_chat(to, body).await,
            None => Err(BackendError::Connection("no XMPP session".to_string())),
        }
    }
}

#[async_trait]
impl Backend for XmppBackend {
    fn kind(&self) -> TargetKind {
        TargetKind::Xmpp
    }

    async fn load(&mut self) -> Result<(), BackendError> {
        self.settings = Some(XmppSettings::from_args(&self.args)?);
        Ok(())
    }

    async fn run(&mut self) -> Result<(), BackendError> {
        self.connect().await?;
        tracing::info!(target_id = %self.target_id, "XMPP session established");
        Ok(())
    }

    async fn execute(&mut self, message: &Message, args: &TargetArgs) -> Result<(), BackendError> {
        let destination = required_arg(args, "destination")?;
        Jid::from_str(&destination).map_err(|e| {
            BackendError::Config(format!("invalid destination {}: {}", destination, e))
        })?;
        let text = message.to_text();
        let mut reconnected = false;

        let alive = match self.session.as_mut() {
            Some(session) => match session.ping().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(target_id = %self.target_id, error = %e, "XMPP ping failed");
                    false
                }
            },
            None => false,
        };

        if !alive {
            self.reconnect().await?;
            reconnected = true;
        }

        match self.send(&destination, &text).await {
            Ok(()) => Ok(()),
            Err(e) if !reconnected && e.is_connection_loss() => {
                tracing::warn!(target_id = %self.target_id, error = %e, "XMPP send failed, retrying once");
                self.reconnect().await?;
                self.send(&destination, &text).await
            }
            Err(e) if e.is_connection_loss() => {
                self.session = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&mut self) -> Result<(), BackendError> {
        match self.session.take() {
            Some(mut session) => session.close().await,
            None => Ok(()),
        }
    }
}

/// Connector backed by `tokio-xmpp`.
pub struct TokioXmppConnector;

#[async_trait]
impl ChatConnector for TokioXmppConnector {
    async fn connect(&self, settings: &XmppSettings) -> Result<Box<dyn ChatSession>, BackendError> {
        let jid = Jid::from_str(&settings.jid)
            .map_err(|e| BackendError::Config(format!("invalid username: {}", e)))?;
        let config = AsyncConfig {
            jid,
            password: settings.password.clone(),
            server: AsyncServerConfig::Manual {
                host: settings.host.clone(),
                port: settings.port,
            },
        };

        let mut client = AsyncClient::new_with_config(config);
        client.set_reconnect(false);

        let online = tokio::time::timeout(CONNECT_TIMEOUT, async {
            while let Some(event) = client.next().await {
                match event {
                    Event::Online { .. } => return Ok(()),
                    Event::Disconnected(e) => return Err(BackendError::Connection(e.to_string())),
                    Event::Stanza(_) => {}
                }
            }
            Err(BackendError::Connection("stream closed during login".to_string()))
        })
        .await
        .map_err(|_| BackendError::Timeout(CONNECT_TIMEOUT))?;
        online?;

        tracing::debug!(host = %settings.host, port = settings.port, "XMPP client online");
        Ok(Box::new(TokioXmppSession { client }))
    }
}

struct TokioXmppSession {
    client: AsyncClient,
}

impl TokioXmppSession {
    async fn send_element(&mut self, element: Element) -> Result<(), BackendError> {
        self.client
            .send_stanza(element)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }
}

#[async_trait]
impl ChatSession for TokioXmppSession {
    async fn ping(&mut self) -> Result<(), BackendError> {
        let id = Uuid::new_v4().to_string();
        self.send_element(Iq::from_get(id.clone(), Ping).into()).await?;

        let client = &mut self.client;
        tokio::time::timeout(PING_TIMEOUT, async {
            while let Some(event) = client.next().await {
                match event {
                    Event::Stanza(el) if el.name() == "iq" && el.attr("id") == Some(id.as_str()) => {
                        return Ok(());
                    }
                    Event::Disconnected(e) => return Err(BackendError::Connection(e.to_string())),
                    _ => {}
                }
            }
            Err(BackendError::Connection("stream closed".to_string()))
        })
        .await
        .map_err(|_| BackendError::Timeout(PING_TIMEOUT))?
    }

    async fn send_chat(&mut self, to: &str, body: &str) -> Result<(), BackendError> {
        let to = Jid::from_str(to)
            .map_err(|e| BackendError::Config(format!("invalid destination {}: {}", to, e)))?;

        let mut stanza = Stanza::new(Some(to));
        stanza.type_ = MessageType::Chat;
        stanza.bodies.insert(String::new(), Body(body.to_string()));

        self.send_element(stanza.into()).await
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.client
            .send_end()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }
}
